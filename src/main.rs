//! # mBot Gateway
//!
//! Bridges the mBot Ranger serial telemetry stream to SQLite and HTTP.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load configuration (file, then CLI/env overrides)
//!    - Set up logging to stdout and, optionally, a file
//!    - Open the measurement database
//!
//! 2. **Running**
//!    - Acquisition task keeps the serial link alive and ingests lines
//!    - Persistence worker drains measurements into SQLite
//!    - Retention job purges old rows once per cleanup interval
//!    - HTTP server answers API requests
//!
//! 3. **Graceful Shutdown** (Ctrl+C)
//!    - Signal every task, release the serial port
//!    - Flush queued measurements, log totals

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mbot_gateway::acquisition::{AcquisitionLoop, AcquisitionSettings};
use mbot_gateway::buffer::RecencyBuffer;
use mbot_gateway::config::{Config, LoggingConfig};
use mbot_gateway::serial::port_trait::TokioSerialOpener;
use mbot_gateway::serial::{ConnectionManager, LinkSettings};
use mbot_gateway::server::{self, AppState};
use mbot_gateway::storage::{
    persistence_channel, run_persistence_worker, spawn_retention_job, MeasurementStore,
    SqliteStore,
};

/// Default configuration file location
const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

#[derive(Parser, Debug)]
#[command(name = "mbot-gateway")]
#[command(about = "Serial telemetry gateway for the mBot Ranger")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "MBOT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the serial device path
    #[arg(long, env = "MBOT_SERIAL_PORT")]
    serial_port: Option<String>,

    /// Override the HTTP listen port
    #[arg(long, env = "MBOT_HTTP_PORT")]
    http_port: Option<u16>,
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        Config::default()
    };

    if let Some(port) = &args.serial_port {
        config.serial.port = port.clone();
    }
    if let Some(port) = args.http_port {
        config.server.port = port;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Install the tracing subscriber; `RUST_LOG` wins over the configured level
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let path = PathBuf::from(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "gateway.log".into());

            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = init_logging(&config.logging)?;

    info!("mBot Gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Serial: {} @ {} baud, HTTP: {}:{}",
        config.serial.port, config.serial.baud_rate, config.server.host, config.server.port
    );

    let store: Arc<dyn MeasurementStore> = Arc::new(
        SqliteStore::open(&config.storage.database_path).context("Failed to open database")?,
    );
    if let Err(e) = store.log_event("INFO", "Gateway started") {
        warn!("Failed to record start-up event: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Persistence
    let (forwarder, queue) = persistence_channel(config.acquisition.persist_queue_capacity);
    let worker = tokio::spawn(run_persistence_worker(Arc::clone(&store), queue));
    let retention = spawn_retention_job(
        Arc::clone(&store),
        config.storage.retention(),
        config.storage.cleanup_interval(),
        shutdown_rx.clone(),
    );

    // Acquisition
    let buffer = Arc::new(RecencyBuffer::new(config.acquisition.buffer_capacity));
    let conn = ConnectionManager::new(
        Arc::new(TokioSerialOpener),
        LinkSettings::from(&config.serial),
    );
    let acquisition = AcquisitionLoop::spawn(
        conn,
        Arc::clone(&buffer),
        forwarder,
        AcquisitionSettings::from(&config),
        shutdown_rx.clone(),
    );

    // HTTP
    let state = Arc::new(AppState {
        buffer,
        link: acquisition.control(),
        store: Arc::clone(&store),
        config: config.clone(),
    });
    let mut http = tokio::spawn(server::serve(state, shutdown_rx));

    info!("Press Ctrl+C to exit");

    let mut http_done = false;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down...");
        }
        result = &mut http => {
            // The server only returns early on a bind or accept failure
            http_done = true;
            match result {
                Ok(Ok(())) => warn!("HTTP server exited unexpectedly"),
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // The loop owns the forwarder; joining it closes the persistence queue
    match acquisition.join().await {
        Ok(stats) => info!(
            "Acquisition stopped: {} records, {} skipped, {} invalid, {} link faults",
            stats.records, stats.skipped, stats.invalid, stats.link_faults
        ),
        Err(e) => error!("Acquisition task failed: {}", e),
    }

    match worker.await {
        Ok(saved) => info!("Total measurements saved: {}", saved),
        Err(e) => error!("Persistence worker failed: {}", e),
    }

    if let Err(e) = retention.await {
        error!("Retention job failed: {}", e);
    }
    if !http_done {
        match http.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("HTTP server error: {}", e),
            Err(e) => error!("HTTP server task failed: {}", e),
        }
    }

    if let Err(e) = store.log_event("INFO", "Gateway stopped") {
        warn!("Failed to record shutdown event: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
