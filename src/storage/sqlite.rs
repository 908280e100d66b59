//! SQLite persistence backend
//!
//! Timestamps are stored as fixed-width UTC RFC 3339 text with microsecond
//! precision, so lexical order in SQL matches chronological order.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ToSql};
use tracing::info;

use super::store::{HistoryQuery, MeasurementStore, Statistics, StoredMeasurement};
use crate::error::Result;
use crate::telemetry::{Measurement, Sample};

const SELECT_COLUMNS: &str =
    "id, time_s, phase, pwm_left, pwm_right, speed_1, speed_2, angle_x, gyro_y, timestamp";

/// SQLite persistence store
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
///
/// # Schema
///
/// ```sql
/// CREATE TABLE measurements (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     timestamp TEXT NOT NULL,
///     time_s REAL, phase INTEGER, pwm_left INTEGER, pwm_right INTEGER,
///     speed_1 REAL, speed_2 REAL, angle_x REAL, gyro_y REAL
/// );
/// CREATE INDEX idx_timestamp ON measurements(timestamp);
///
/// CREATE TABLE system_log (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     timestamp TEXT NOT NULL,
///     level TEXT NOT NULL,
///     message TEXT NOT NULL
/// );
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

/// Canonical text form of a timestamp in the database
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(index: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_timestamp(
    index: usize,
    text: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_timestamp(index, &t)).transpose()
}

impl SqliteStore {
    /// Open (or create) a file-based database, creating parent directories
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.init_schema()?;
        info!("Database initialized at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    // Statements are single-shot; a panicked holder cannot leave a
    // half-applied write behind.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                time_s REAL NOT NULL,
                phase INTEGER NOT NULL,
                pwm_left INTEGER NOT NULL,
                pwm_right INTEGER NOT NULL,
                speed_1 REAL NOT NULL,
                speed_2 REAL NOT NULL,
                angle_x REAL NOT NULL,
                gyro_y REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_timestamp ON measurements(timestamp);
            CREATE TABLE IF NOT EXISTS system_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            );",
        )?;

        Ok(())
    }

    fn row_to_measurement(row: &rusqlite::Row) -> rusqlite::Result<StoredMeasurement> {
        let timestamp: String = row.get(9)?;

        Ok(StoredMeasurement {
            id: row.get(0)?,
            sample: Sample {
                time_s: row.get(1)?,
                phase: row.get(2)?,
                pwm_left: row.get(3)?,
                pwm_right: row.get(4)?,
                speed_1: row.get(5)?,
                speed_2: row.get(6)?,
                angle_x: row.get(7)?,
                gyro_y: row.get(8)?,
            },
            timestamp: parse_timestamp(9, &timestamp)?,
        })
    }
}

impl MeasurementStore for SqliteStore {
    fn insert(&self, measurement: &Measurement) -> Result<i64> {
        let conn = self.conn();
        let s = measurement.sample();

        conn.execute(
            "INSERT INTO measurements
             (timestamp, time_s, phase, pwm_left, pwm_right, speed_1, speed_2, angle_x, gyro_y)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                format_timestamp(measurement.timestamp()),
                s.time_s,
                s.phase,
                s.pwm_left,
                s.pwm_right,
                s.speed_1,
                s.speed_2,
                s.angle_x,
                s.gyro_y,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn query(&self, query: &HistoryQuery) -> Result<Vec<StoredMeasurement>> {
        let mut sql = format!("SELECT {} FROM measurements WHERE 1=1", SELECT_COLUMNS);
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(start) = query.start {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(format_timestamp(start)));
        }
        if let Some(end) = query.end {
            sql.push_str(" AND timestamp <= ?");
            args.push(Box::new(format_timestamp(end)));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        args.push(Box::new(i64::try_from(query.limit).unwrap_or(i64::MAX)));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_measurement)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn statistics(&self, window: chrono::Duration) -> Result<Statistics> {
        let conn = self.conn();

        let (total, first, last): (i64, Option<String>, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM measurements",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let cutoff = format_timestamp(Utc::now() - window);
        let (avg_angle, avg_speed_1, avg_speed_2): (Option<f64>, Option<f64>, Option<f64>) = conn
            .query_row(
                "SELECT AVG(angle_x), AVG(speed_1), AVG(speed_2)
                 FROM measurements
                 WHERE timestamp > ?1",
                [cutoff],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        Ok(Statistics {
            total_measurements: u64::try_from(total).unwrap_or(0),
            first_measurement: parse_optional_timestamp(1, first)?,
            last_measurement: parse_optional_timestamp(2, last)?,
            window_minutes: window.num_minutes(),
            avg_angle,
            avg_speed_1,
            avg_speed_2,
        })
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM measurements WHERE timestamp < ?1",
            [format_timestamp(cutoff)],
        )?;
        Ok(deleted)
    }

    fn log_event(&self, level: &str, message: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO system_log (timestamp, level, message) VALUES (?1, ?2, ?3)",
            params![format_timestamp(Utc::now()), level, message],
        )?;
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn measurement_at(time_s: f64, angle_x: f64, timestamp: DateTime<Utc>) -> Measurement {
        Measurement::new(
            Sample {
                time_s,
                phase: 1,
                pwm_left: 100,
                pwm_right: 120,
                speed_1: 5.0,
                speed_2: 7.0,
                angle_x,
                gyro_y: 0.01,
            },
            timestamp,
        )
    }

    #[test]
    fn test_format_timestamp_fixed_width() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(ts), "2026-01-02T03:04:05.000000Z");
    }

    #[test]
    fn test_insert_and_count() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();

        let first = store.insert(&measurement_at(1.0, 0.0, now)).unwrap();
        let second = store.insert(&measurement_at(2.0, 0.0, now)).unwrap();

        assert!(second > first);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_query_round_trip_fields() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        let original = measurement_at(12.5, 0.2, now);
        store.insert(&original).unwrap();

        let rows = store.query(&HistoryQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0].sample, original.sample());
        assert_eq!(
            format_timestamp(rows[0].timestamp),
            format_timestamp(original.timestamp())
        );
    }

    #[test]
    fn test_query_newest_first_with_limit() {
        let store = SqliteStore::new_in_memory().unwrap();
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..5 {
            store
                .insert(&measurement_at(i as f64, 0.0, base + Duration::seconds(i)))
                .unwrap();
        }

        let rows = store
            .query(&HistoryQuery {
                limit: 3,
                ..HistoryQuery::default()
            })
            .unwrap();

        let times: Vec<f64> = rows.iter().map(|r| r.sample.time_s).collect();
        assert_eq!(times, vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_query_time_range() {
        let store = SqliteStore::new_in_memory().unwrap();
        let base = Utc::now() - Duration::hours(1);
        for i in 0..10 {
            store
                .insert(&measurement_at(i as f64, 0.0, base + Duration::minutes(i)))
                .unwrap();
        }

        let rows = store
            .query(&HistoryQuery {
                start: Some(base + Duration::minutes(3)),
                end: Some(base + Duration::minutes(6)),
                limit: 100,
            })
            .unwrap();

        let times: Vec<f64> = rows.iter().map(|r| r.sample.time_s).collect();
        assert_eq!(times, vec![6.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_statistics() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        store.insert(&measurement_at(0.0, 10.0, now - Duration::hours(3))).unwrap();
        store.insert(&measurement_at(1.0, 1.0, now - Duration::minutes(5))).unwrap();
        store.insert(&measurement_at(2.0, 3.0, now - Duration::minutes(1))).unwrap();

        let stats = store.statistics(Duration::hours(1)).unwrap();
        assert_eq!(stats.total_measurements, 3);
        assert_eq!(stats.window_minutes, 60);
        assert_eq!(stats.avg_angle, Some(2.0));
        assert_eq!(stats.avg_speed_1, Some(5.0));
        assert_eq!(stats.avg_speed_2, Some(7.0));
        assert!(stats.first_measurement.unwrap() < stats.last_measurement.unwrap());
    }

    #[test]
    fn test_statistics_empty_store() {
        let store = SqliteStore::new_in_memory().unwrap();
        let stats = store.statistics(Duration::hours(1)).unwrap();

        assert_eq!(stats.total_measurements, 0);
        assert!(stats.first_measurement.is_none());
        assert!(stats.avg_angle.is_none());
    }

    #[test]
    fn test_purge_older_than() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        store.insert(&measurement_at(0.0, 0.0, now - Duration::days(40))).unwrap();
        store.insert(&measurement_at(1.0, 0.0, now - Duration::days(31))).unwrap();
        store.insert(&measurement_at(2.0, 0.0, now - Duration::days(1))).unwrap();

        let deleted = store.purge_older_than(now - Duration::days(30)).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count().unwrap(), 1);

        assert_eq!(store.purge_older_than(now - Duration::days(30)).unwrap(), 0);
    }

    #[test]
    fn test_log_event() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.log_event("INFO", "Experiment started").unwrap();

        let conn = store.conn();
        let (level, message): (String, String) = conn
            .query_row("SELECT level, message FROM system_log", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(level, "INFO");
        assert_eq!(message, "Experiment started");
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mbot_data.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(&measurement_at(1.0, 0.0, Utc::now())).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
