//! Persistence handoff
//!
//! The acquisition task must never wait on the database. It pushes each
//! measurement into a bounded queue with `try_send`; a separate task drains
//! the queue and writes through `spawn_blocking`. A full queue drops the
//! record (it stays in the recency buffer) and reports `QueueFull`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use super::store::MeasurementStore;
use crate::acquisition::MeasurementConsumer;
use crate::error::{GatewayError, Result};
use crate::telemetry::Measurement;

/// Consumer that forwards measurements to the persistence worker
#[derive(Debug, Clone)]
pub struct PersistenceForwarder {
    tx: mpsc::Sender<Measurement>,
}

impl MeasurementConsumer for PersistenceForwarder {
    fn consume(&mut self, measurement: &Measurement) -> Result<()> {
        self.tx.try_send(measurement.clone()).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::QueueFull,
            TrySendError::Closed(_) => GatewayError::ChannelClosed,
        })
    }
}

/// Create the forwarder and the queue it feeds
pub fn persistence_channel(capacity: usize) -> (PersistenceForwarder, mpsc::Receiver<Measurement>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PersistenceForwarder { tx }, rx)
}

/// Drain the queue into `store` until every forwarder is dropped
///
/// Returns the number of measurements written.
pub async fn run_persistence_worker(
    store: Arc<dyn MeasurementStore>,
    mut rx: mpsc::Receiver<Measurement>,
) -> u64 {
    let mut saved: u64 = 0;
    let mut failed: u64 = 0;

    while let Some(measurement) = rx.recv().await {
        let store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || store.insert(&measurement)).await {
            Ok(Ok(_id)) => saved += 1,
            Ok(Err(e)) => {
                failed += 1;
                warn!("Failed to save measurement: {}", e);
            }
            Err(e) => {
                failed += 1;
                error!("Persistence task panicked: {}", e);
            }
        }
    }

    info!("Persistence worker stopped: {} saved, {} failed", saved, failed);
    saved
}
