//! # HTTP Server Module
//!
//! REST surface over the gateway.
//!
//! # Endpoints
//!
//! - `GET /api/status` - Link and buffer status
//! - `GET /api/data/latest` - Newest buffered measurement
//! - `GET /api/data/buffer?limit=N` - Recent measurements from memory
//! - `GET /api/data/history?start=&end=&limit=` - Stored measurements
//! - `GET /api/data/export?start=&end=` - Stored measurements as CSV
//! - `GET /api/statistics` - Store totals and trailing averages
//! - `POST /api/control/start` - Send the start byte to the device
//! - `GET /api/config` - Effective configuration
//!
//! Handlers never touch the serial port; they read the recency buffer,
//! query the store, or send a command through [`LinkControl`].

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::acquisition::LinkControl;
use crate::buffer::RecencyBuffer;
use crate::config::Config;
use crate::error::Result;
use crate::storage::MeasurementStore;

/// Shared application state
pub struct AppState {
    pub buffer: Arc<RecencyBuffer>,
    pub link: LinkControl,
    pub store: Arc<dyn MeasurementStore>,
    pub config: Config,
}

/// API routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/data/latest", get(handlers::latest))
        .route("/api/data/buffer", get(handlers::buffer))
        .route("/api/data/history", get(handlers::history))
        .route("/api/data/export", get(handlers::export))
        .route("/api/statistics", get(handlers::statistics))
        .route("/api/control/start", post(handlers::start))
        .route("/api/config", get(handlers::config))
}

/// Full router with middleware
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors_enabled = state.config.server.cors_enabled;
    let mut router = api_routes().layer(TraceLayer::new_for_http());

    if cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

/// Bind and serve until `shutdown` fires
pub async fn serve(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server: http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            // Either a shutdown signal or a dropped sender ends the server
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
