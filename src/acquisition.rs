//! # Acquisition Loop
//!
//! Long-lived task that keeps the serial link alive and turns device lines
//! into measurements.
//!
//! Per iteration:
//! 1. Not connected: wait the reconnect interval (skipped on the very first
//!    attempt), then try to open. Retries are unbounded.
//! 2. Connected: read one line with a short timeout. A timeout just loops;
//!    a link fault drops back to step 1.
//! 3. Data line: stamp it, push it into the [`RecencyBuffer`] and hand it to
//!    the [`MeasurementConsumer`]. Consumer failures are logged and ignored.
//!
//! The loop is the only owner of the [`ConnectionManager`]. Other tasks reach
//! the link through a [`LinkControl`]: link status over a `watch` channel and
//! commands over a bounded `mpsc` channel, executed between reads.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Level};

use crate::buffer::RecencyBuffer;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::serial::{ConnectionManager, LinkStatus, START_COMMAND};
use crate::telemetry::{parse_line, IngestClock, LineOutcome, Measurement, SkipReason};

/// Depth of the command queue from the HTTP surface
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Receives every parsed measurement, synchronously, on the acquisition task
///
/// Implementations must return quickly; anything slow belongs behind a
/// queue (see `storage::PersistenceForwarder`). Errors never stop ingestion.
pub trait MeasurementConsumer: Send {
    fn consume(&mut self, measurement: &Measurement) -> Result<()>;
}

impl<F> MeasurementConsumer for F
where
    F: FnMut(&Measurement) -> Result<()> + Send,
{
    fn consume(&mut self, measurement: &Measurement) -> Result<()> {
        self(measurement)
    }
}

/// Request executed by the acquisition task on behalf of another task
#[derive(Debug)]
pub enum Command {
    /// Write one byte to the device
    Send {
        byte: u8,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Timing and logging parameters of the loop
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub read_timeout: Duration,
    pub reconnect_interval: Duration,
    /// Log every Nth consecutive open failure
    pub failure_log_every: u32,
    /// Log a progress line every N records
    pub log_every_records: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for AcquisitionSettings {
    fn from(config: &Config) -> Self {
        Self {
            read_timeout: config.serial.read_timeout(),
            reconnect_interval: config.serial.reconnect_interval(),
            failure_log_every: config.serial.failure_log_every.max(1),
            log_every_records: config.acquisition.log_every_records.max(1),
        }
    }
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionStats {
    pub lines: u64,
    pub records: u64,
    pub skipped: u64,
    pub invalid: u64,
    pub consumer_failures: u64,
    pub connects: u64,
    pub link_faults: u64,
    pub open_failures: u64,
}

/// Cloneable access to the link for tasks other than the acquisition loop
#[derive(Debug, Clone)]
pub struct LinkControl {
    status: watch::Receiver<LinkStatus>,
    commands: mpsc::Sender<Command>,
}

impl LinkControl {
    pub fn new(status: watch::Receiver<LinkStatus>, commands: mpsc::Sender<Command>) -> Self {
        Self { status, commands }
    }

    /// Latest published link status
    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Ask the acquisition task to write `byte` and wait for the outcome
    ///
    /// # Errors
    ///
    /// `NotConnected` if the link is down, `LinkFault` if the write failed,
    /// `ChannelClosed` if the acquisition task has exited.
    pub async fn send_command(&self, byte: u8) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send { byte, reply })
            .await
            .map_err(|_| GatewayError::ChannelClosed)?;
        outcome.await.map_err(|_| GatewayError::ChannelClosed)?
    }

    /// Signal the device to begin an experiment run
    pub async fn send_start(&self) -> Result<()> {
        self.send_command(START_COMMAND).await
    }
}

/// Handle to a spawned acquisition loop
#[derive(Debug)]
pub struct AcquisitionHandle {
    control: LinkControl,
    task: JoinHandle<AcquisitionStats>,
}

impl AcquisitionHandle {
    pub fn control(&self) -> LinkControl {
        self.control.clone()
    }

    /// Wait for the loop to exit after shutdown was signalled
    pub async fn join(self) -> Result<AcquisitionStats> {
        self.task
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))
    }
}

/// Log level for a failed open
///
/// The very first failure at startup is an error. After that the first
/// failure of a run and every `every`th consecutive one warn; the rest are
/// debug, so a board left unplugged logs about once a minute.
fn open_failure_level(startup: bool, failures: u32, every: u32) -> Level {
    if startup {
        Level::ERROR
    } else if failures == 1 || failures % every.max(1) == 0 {
        Level::WARN
    } else {
        Level::DEBUG
    }
}

enum Event {
    Line(Result<Option<String>>),
    Command(Command),
    Shutdown,
}

/// The acquisition loop state
pub struct AcquisitionLoop<C: MeasurementConsumer> {
    conn: ConnectionManager,
    buffer: Arc<RecencyBuffer>,
    consumer: C,
    settings: AcquisitionSettings,
    clock: IngestClock,
    status_tx: watch::Sender<LinkStatus>,
    commands: mpsc::Receiver<Command>,
    stats: AcquisitionStats,
}

impl<C: MeasurementConsumer + 'static> AcquisitionLoop<C> {
    /// Build the loop and the [`LinkControl`] that talks to it
    pub fn new(
        conn: ConnectionManager,
        buffer: Arc<RecencyBuffer>,
        consumer: C,
        settings: AcquisitionSettings,
    ) -> (Self, LinkControl) {
        let (status_tx, status_rx) = watch::channel(conn.status());
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let acquisition = Self {
            conn,
            buffer,
            consumer,
            settings,
            clock: IngestClock::new(),
            status_tx,
            commands,
            stats: AcquisitionStats::default(),
        };
        (acquisition, LinkControl::new(status_rx, command_tx))
    }

    /// Spawn the loop on its own task
    ///
    /// # Arguments
    ///
    /// * `conn` - Manager for the device link; the loop takes sole ownership
    /// * `buffer` - Shared recency buffer every record is pushed into
    /// * `consumer` - Called once per record on the loop's task
    /// * `settings` - Read timeout, reconnect interval, log throttling
    /// * `shutdown` - Loop exits when this turns true or its sender drops
    ///
    /// # Returns
    ///
    /// * `AcquisitionHandle` - Link control for other tasks, and the join
    ///   handle yielding the final [`AcquisitionStats`]
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use mbot_gateway::acquisition::{AcquisitionLoop, AcquisitionSettings};
    /// use mbot_gateway::buffer::RecencyBuffer;
    /// use mbot_gateway::config::Config;
    /// use mbot_gateway::error::Result;
    /// use mbot_gateway::serial::port_trait::TokioSerialOpener;
    /// use mbot_gateway::serial::{ConnectionManager, LinkSettings};
    /// use mbot_gateway::telemetry::Measurement;
    /// use tokio::sync::watch;
    ///
    /// # async fn example() -> Result<()> {
    /// let config = Config::default();
    /// let conn = ConnectionManager::new(
    ///     Arc::new(TokioSerialOpener),
    ///     LinkSettings::from(&config.serial),
    /// );
    /// let buffer = Arc::new(RecencyBuffer::new(config.acquisition.buffer_capacity));
    /// let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ///
    /// let handle = AcquisitionLoop::spawn(
    ///     conn,
    ///     Arc::clone(&buffer),
    ///     |m: &Measurement| -> Result<()> {
    ///         println!("angle {}", m.sample().angle_x);
    ///         Ok(())
    ///     },
    ///     AcquisitionSettings::from(&config),
    ///     shutdown_rx,
    /// );
    ///
    /// handle.control().send_start().await?;
    /// let _ = shutdown_tx.send(true);
    /// let stats = handle.join().await?;
    /// println!("{} records", stats.records);
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(
        conn: ConnectionManager,
        buffer: Arc<RecencyBuffer>,
        consumer: C,
        settings: AcquisitionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> AcquisitionHandle {
        let (acquisition, control) = Self::new(conn, buffer, consumer, settings);
        let task = tokio::spawn(acquisition.run(shutdown));
        AcquisitionHandle { control, task }
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AcquisitionStats {
        info!("Serial read loop started");
        let mut first_attempt = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.conn.is_open() {
                if !first_attempt && self.idle(self.settings.reconnect_interval, &mut shutdown).await {
                    break;
                }
                first_attempt = false;

                if self.connect(&mut shutdown).await {
                    break;
                }
                continue;
            }

            let timeout = self.settings.read_timeout;
            let event = tokio::select! {
                line = self.conn.read_line(timeout) => Event::Line(line),
                Some(command) = self.commands.recv() => Event::Command(command),
                _ = shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Line(Ok(Some(line))) => self.handle_line(&line),
                Event::Line(Ok(None)) => {}
                Event::Line(Err(e)) => {
                    self.stats.link_faults += 1;
                    warn!("Serial connection lost ({}), attempting to reconnect...", e);
                }
                Event::Command(command) => self.handle_command(command).await,
                Event::Shutdown => break,
            }
            self.publish_status();
        }

        self.conn.stop();
        self.publish_status();
        info!(
            "Serial read loop stopped: {} records from {} lines ({} invalid, {} consumer failures, {} link faults)",
            self.stats.records,
            self.stats.lines,
            self.stats.invalid,
            self.stats.consumer_failures,
            self.stats.link_faults
        );
        self.stats
    }

    /// Try to open the link once. Returns true if shutdown was requested.
    async fn connect(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let opened = tokio::select! {
            result = self.conn.open() => Some(result),
            _ = shutdown.changed() => None,
        };

        match opened {
            None => return true,
            Some(Ok(())) => {
                self.stats.connects += 1;
            }
            Some(Err(e)) => {
                self.stats.open_failures += 1;
                let failures = self.conn.status().consecutive_failures;
                let startup = self.stats.connects == 0 && self.stats.open_failures == 1;
                let level = open_failure_level(startup, failures, self.settings.failure_log_every);
                if level == Level::ERROR {
                    error!(
                        "Failed to connect to device: {} (will keep retrying every {:?})",
                        e, self.settings.reconnect_interval
                    );
                } else if level == Level::WARN {
                    warn!("Reconnect attempt {} failed: {}", failures, e);
                } else {
                    debug!("Reconnect attempt {} failed: {}", failures, e);
                }
            }
        }
        self.publish_status();
        false
    }

    /// Sleep while disconnected, still answering commands. Returns true if
    /// shutdown was requested.
    async fn idle(&mut self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                _ = &mut deadline => return false,
                Some(command) = self.commands.recv() => Event::Command(command),
                _ = shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Command(command) => self.handle_command(command).await,
                Event::Shutdown => return true,
                Event::Line(_) => {}
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        self.stats.lines += 1;

        match parse_line(line) {
            LineOutcome::Record(sample) => {
                let measurement = self.clock.stamp(sample);
                self.buffer.push(measurement.clone());

                if let Err(e) = self.consumer.consume(&measurement) {
                    self.stats.consumer_failures += 1;
                    warn!("Measurement consumer failed: {}", e);
                }

                self.stats.records += 1;
                if self.stats.records % self.settings.log_every_records == 0 {
                    info!(
                        "Ingested {} measurements ({} buffered)",
                        self.stats.records,
                        self.buffer.size()
                    );
                }
            }
            LineOutcome::Skipped(SkipReason::Comment) => {
                self.stats.skipped += 1;
                debug!("Device: {}", line);
            }
            LineOutcome::Skipped(reason) => {
                self.stats.skipped += 1;
                trace!("Skipping {:?} line: {}", reason, line);
            }
            LineOutcome::Invalid(reason) => {
                self.stats.invalid += 1;
                trace!("Discarding line {:?}: {}", line, reason);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { byte, reply } => {
                let result = self.conn.send_command(byte).await;
                match &result {
                    Ok(()) if byte == START_COMMAND => info!("Sent START command to device"),
                    Ok(()) => {}
                    Err(GatewayError::LinkFault(_)) => self.stats.link_faults += 1,
                    Err(_) => {}
                }
                // Requester may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    fn publish_status(&self) {
        let status = self.conn.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}
