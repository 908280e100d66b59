//! # Telemetry Module
//!
//! Typed telemetry records and the line codec for the device protocol.
//!
//! This module handles:
//! - The 8-field device sample and its ingestion-stamped form
//! - Monotonic ingestion timestamps
//! - Classifying raw text lines into records, banner/comment text or garbage

pub mod codec;
pub mod measurement;

pub use codec::{parse_line, InvalidLine, LineOutcome, SkipReason};
pub use measurement::{IngestClock, Measurement, Sample};
