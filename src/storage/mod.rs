//! # Storage Module
//!
//! Durable history of measurements and system events.
//!
//! This module handles:
//! - The backend-agnostic [`MeasurementStore`] trait
//! - The SQLite backend
//! - Handing measurements off the acquisition task through a bounded queue
//! - The periodic retention cleanup job

pub mod retention;
pub mod sqlite;
pub mod store;
pub mod worker;

pub use retention::{run_cleanup, spawn_retention_job};
pub use sqlite::SqliteStore;
pub use store::{HistoryQuery, MeasurementStore, Statistics, StoredMeasurement};
pub use worker::{persistence_channel, run_persistence_worker, PersistenceForwarder};
