//! Persistence store abstraction
//!
//! Defines the trait for measurement storage backends.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::telemetry::{Measurement, Sample};

/// Default row limit for history queries
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// A measurement as read back from storage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMeasurement {
    pub id: i64,

    #[serde(flatten)]
    pub sample: Sample,

    /// Ingestion timestamp
    pub timestamp: DateTime<Utc>,
}

/// Time-range query over stored measurements
///
/// Both bounds are inclusive; `None` leaves that side open.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Summary over the whole store plus averages over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub total_measurements: u64,
    pub first_measurement: Option<DateTime<Utc>>,
    pub last_measurement: Option<DateTime<Utc>>,
    pub window_minutes: i64,
    pub avg_angle: Option<f64>,
    pub avg_speed_1: Option<f64>,
    pub avg_speed_2: Option<f64>,
}

/// Persistence store trait
///
/// Implementations are blocking; async callers go through
/// `tokio::task::spawn_blocking`.
#[cfg_attr(test, mockall::automock)]
pub trait MeasurementStore: Send + Sync {
    /// Save one measurement, returning its row id
    fn insert(&self, measurement: &Measurement) -> Result<i64>;

    /// Measurements in range, newest first, at most `query.limit`
    fn query(&self, query: &HistoryQuery) -> Result<Vec<StoredMeasurement>>;

    /// Totals and averages over the trailing `window`
    fn statistics(&self, window: chrono::Duration) -> Result<Statistics>;

    /// Delete measurements stamped before `cutoff`, returning how many
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Record a system event
    fn log_event(&self, level: &str, message: &str) -> Result<()>;

    /// Number of stored measurements
    fn count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_history_query() {
        let query = HistoryQuery::default();
        assert!(query.start.is_none());
        assert!(query.end.is_none());
        assert_eq!(query.limit, 10_000);
    }

    #[test]
    fn test_stored_measurement_serialization() {
        let stored = StoredMeasurement {
            id: 7,
            sample: Sample {
                time_s: 1.5,
                phase: 2,
                pwm_left: -10,
                pwm_right: 10,
                speed_1: 0.5,
                speed_2: 0.25,
                angle_x: -1.0,
                gyro_y: 3.0,
            },
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["phase"], 2);
        assert_eq!(json["pwm_left"], -10);
        assert!(json["timestamp"].is_string());
    }
}
