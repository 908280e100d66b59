//! Periodic retention cleanup
//!
//! Runs independently of ingestion and never touches the recency buffer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::store::MeasurementStore;
use crate::error::{GatewayError, Result};

/// Delete measurements older than `retention`
pub async fn run_cleanup(
    store: Arc<dyn MeasurementStore>,
    retention: chrono::Duration,
) -> Result<usize> {
    let cutoff = Utc::now() - retention;
    let deleted = tokio::task::spawn_blocking(move || store.purge_older_than(cutoff))
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))??;

    info!("Cleanup task: deleted {} old records", deleted);
    Ok(deleted)
}

/// Spawn the cleanup job; the first run happens one `period` after start
pub fn spawn_retention_job(
    store: Arc<dyn MeasurementStore>,
    retention: chrono::Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = run_cleanup(Arc::clone(&store), retention).await {
                        error!("Cleanup task error: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MockMeasurementStore;

    #[tokio::test]
    async fn test_cleanup_uses_retention_cutoff() {
        let mut store = MockMeasurementStore::new();
        store
            .expect_purge_older_than()
            .withf(|cutoff| {
                let age = Utc::now() - *cutoff;
                let retention = chrono::Duration::days(30);
                age >= retention && age < retention + chrono::Duration::minutes(1)
            })
            .times(1)
            .returning(|_| Ok(42));

        let deleted = run_cleanup(Arc::new(store), chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 42);
    }

    #[tokio::test]
    async fn test_cleanup_propagates_store_error() {
        let mut store = MockMeasurementStore::new();
        store
            .expect_purge_older_than()
            .returning(|_| Err(GatewayError::Consumer("locked".to_string())));

        let result = run_cleanup(Arc::new(store), chrono::Duration::days(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_each_period_and_survives_errors() {
        let mut store = MockMeasurementStore::new();
        let mut calls = 0;
        store.expect_purge_older_than().times(3).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(GatewayError::Consumer("locked".to_string()))
            } else {
                Ok(0)
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let job = spawn_retention_job(
            Arc::new(store),
            chrono::Duration::days(30),
            Duration::from_secs(3600),
            shutdown_rx,
        );

        // Nothing at start; runs at 1h, 2h, 3h
        tokio::time::sleep(Duration::from_secs(3 * 3600 + 60)).await;
        shutdown_tx.send(true).unwrap();
        job.await.unwrap();
    }
}
