//! # Measurement Types
//!
//! A [`Sample`] is what the device sends on one line. A [`Measurement`] is a
//! sample that has entered the pipeline and carries the gateway's ingestion
//! timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry sample as reported by the device
///
/// Field order matches the CSV order on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Device elapsed time in seconds
    pub time_s: f64,

    /// Test phase code (0 idle, 1 motor test, 2 balance test, 3 complete)
    pub phase: i32,

    /// Left motor PWM duty
    pub pwm_left: i32,

    /// Right motor PWM duty
    pub pwm_right: i32,

    /// Encoder 1 speed
    pub speed_1: f64,

    /// Encoder 2 speed
    pub speed_2: f64,

    /// Complementary-filtered tilt angle (degrees)
    pub angle_x: f64,

    /// Gyro angular rate around Y
    pub gyro_y: f64,
}

/// A sample stamped with its ingestion time
///
/// Immutable once constructed; fields are exposed through accessors only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    #[serde(flatten)]
    sample: Sample,

    /// Wall-clock time at which the gateway accepted the sample
    timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Build a measurement from a sample and an explicit ingestion time
    pub fn new(sample: Sample, timestamp: DateTime<Utc>) -> Self {
        Self { sample, timestamp }
    }

    /// The device-reported fields
    pub fn sample(&self) -> &Sample {
        &self.sample
    }

    /// Ingestion timestamp assigned by the gateway
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Assigns ingestion timestamps that never go backwards
///
/// If the wall clock steps back (NTP correction, RTC reset) the previous
/// timestamp is reused, so the ordering within one pipeline stays intact.
#[derive(Debug, Default)]
pub struct IngestClock {
    last: Option<DateTime<Utc>>,
}

impl IngestClock {
    /// Create a clock with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a sample with the current wall-clock time
    pub fn stamp(&mut self, sample: Sample) -> Measurement {
        self.stamp_at(sample, Utc::now())
    }

    /// Stamp a sample as if the wall clock read `now`
    pub fn stamp_at(&mut self, sample: Sample, now: DateTime<Utc>) -> Measurement {
        let timestamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(timestamp);
        Measurement::new(sample, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> Sample {
        Sample {
            time_s: 12.5,
            phase: 1,
            pwm_left: 100,
            pwm_right: 120,
            speed_1: 5.4,
            speed_2: 5.6,
            angle_x: 0.2,
            gyro_y: 0.01,
        }
    }

    #[test]
    fn test_stamp_uses_given_time() {
        let mut clock = IngestClock::new();
        let now = Utc::now();
        let m = clock.stamp_at(sample(), now);
        assert_eq!(m.timestamp(), now);
        assert_eq!(m.sample(), &sample());
    }

    #[test]
    fn test_stamp_never_goes_backwards() {
        let mut clock = IngestClock::new();
        let t0 = Utc::now();
        let first = clock.stamp_at(sample(), t0);
        let second = clock.stamp_at(sample(), t0 - Duration::seconds(30));
        assert_eq!(second.timestamp(), first.timestamp());

        let third = clock.stamp_at(sample(), t0 + Duration::seconds(1));
        assert!(third.timestamp() > second.timestamp());
    }

    #[test]
    fn test_serialize_flattens_sample_fields() {
        let m = Measurement::new(sample(), Utc::now());
        let json = serde_json::to_value(&m).unwrap();

        assert_eq!(json["time_s"], 12.5);
        assert_eq!(json["phase"], 1);
        assert_eq!(json["pwm_right"], 120);
        assert_eq!(json["gyro_y"], 0.01);
        assert!(json["timestamp"].is_string());
        assert!(json.get("sample").is_none());
    }
}
