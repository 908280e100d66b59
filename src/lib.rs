//! # mBot Gateway Library
//!
//! Serial telemetry gateway for an mBot Ranger balancing robot.
//!
//! This library reads CSV telemetry lines from the robot's serial port,
//! keeps a bounded window of recent measurements in memory, persists every
//! measurement to SQLite and serves both over a small REST API.

pub mod acquisition;
pub mod buffer;
pub mod config;
pub mod error;
pub mod serial;
pub mod server;
pub mod storage;
pub mod telemetry;
