//! # Line Codec
//!
//! Classifies one text line from the device into a [`LineOutcome`].
//!
//! The device prints CSV data lines interleaved with human-readable text:
//!
//! ```text
//! # Calibrating gyro...
//! ===== CSV Header =====
//! time,phase,pwm_left,pwm_right,speed_1,speed_2,angleX,gyroY
//! 12.5,1,100,120,5.4,5.6,0.2,0.01
//! ```
//!
//! Malformed input is a normal case (partial lines after a reconnect, boot
//! noise), so parsing never returns an error. The caller decides what to log.
//!
//! ```
//! use mbot_gateway::telemetry::{parse_line, LineOutcome, SkipReason};
//!
//! match parse_line("12.5,1,100,120,5.4,5.6,0.2,0.01") {
//!     LineOutcome::Record(sample) => assert_eq!(sample.pwm_left, 100),
//!     other => panic!("unexpected outcome: {:?}", other),
//! }
//!
//! assert_eq!(parse_line("# boot ok"), LineOutcome::Skipped(SkipReason::Comment));
//! ```

use std::fmt;
use std::str::FromStr;

use super::measurement::Sample;

/// Number of comma-separated fields in a data line
pub const FIELD_COUNT: usize = 8;

/// Prefix of diagnostic text emitted by the firmware
pub const COMMENT_MARKER: char = '#';

/// Prefix of banner lines emitted by the firmware
pub const BANNER_MARKER: char = '=';

/// Text that marks the CSV header banner
pub const HEADER_TEXT: &str = "CSV Header";

/// Field names in wire order
pub const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "time_s", "phase", "pwm_left", "pwm_right", "speed_1", "speed_2", "angle_x", "gyro_y",
];

/// Result of classifying one line
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// A well-formed data line
    Record(Sample),
    /// Not data, by design (blank, comment or banner)
    Skipped(SkipReason),
    /// Looked like data but could not be converted
    Invalid(InvalidLine),
}

/// Why a line was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Empty after trimming
    Empty,
    /// Diagnostic text starting with `#`
    Comment,
    /// Banner or header text
    Banner,
}

/// Why a data-looking line was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidLine {
    /// Wrong number of comma-separated fields
    FieldCount { found: usize },
    /// A field failed numeric conversion
    BadField { index: usize, name: &'static str },
}

impl fmt::Display for InvalidLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidLine::FieldCount { found } => {
                write!(f, "expected {} fields, found {}", FIELD_COUNT, found)
            }
            InvalidLine::BadField { index, name } => {
                write!(f, "field {} ({}) is not numeric", index, name)
            }
        }
    }
}

/// Parse one line (without its terminator)
pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim();

    if line.is_empty() {
        return LineOutcome::Skipped(SkipReason::Empty);
    }
    if line.starts_with(COMMENT_MARKER) {
        return LineOutcome::Skipped(SkipReason::Comment);
    }
    if line.starts_with(BANNER_MARKER) || line.contains(HEADER_TEXT) {
        return LineOutcome::Skipped(SkipReason::Banner);
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return LineOutcome::Invalid(InvalidLine::FieldCount { found: fields.len() });
    }

    match decode_fields(&fields) {
        Ok(sample) => LineOutcome::Record(sample),
        Err(invalid) => LineOutcome::Invalid(invalid),
    }
}

fn decode_fields(fields: &[&str]) -> Result<Sample, InvalidLine> {
    Ok(Sample {
        time_s: field(fields, 0)?,
        phase: field(fields, 1)?,
        pwm_left: field(fields, 2)?,
        pwm_right: field(fields, 3)?,
        speed_1: field(fields, 4)?,
        speed_2: field(fields, 5)?,
        angle_x: field(fields, 6)?,
        gyro_y: field(fields, 7)?,
    })
}

fn field<T: FromStr>(fields: &[&str], index: usize) -> Result<T, InvalidLine> {
    fields[index].parse().map_err(|_| InvalidLine::BadField {
        index,
        name: FIELD_NAMES[index],
    })
}
