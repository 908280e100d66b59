//! # Serial Communication Module
//!
//! Owns the serial link to the mBot controller board.
//!
//! This module handles:
//! - Opening the port at the configured baud rate (115,200 by default)
//! - Waiting for the board to finish its reset after the port opens
//! - Reading newline-delimited lines with a bounded timeout
//! - Sending single-byte commands
//! - The Disconnected / Connecting / Connected / Stopped state machine
//!
//! Retry policy lives in the acquisition loop; a failed `open` here only
//! reports the failure.

pub mod port_trait;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::error::{GatewayError, Result};
use port_trait::{BoxedPort, PortOpener};

/// Default baud rate of the firmware
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Command byte that starts an experiment run on the device
pub const START_COMMAND: u8 = b'S';

/// Longest accepted line in bytes; a data line is well under 100
pub const MAX_LINE_LEN: usize = 1024;

/// Lifecycle state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; no further transitions
    Stopped,
}

/// Observable snapshot of the connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub port: String,
    pub baud_rate: u32,
    pub state: LinkState,
    pub consecutive_failures: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl LinkStatus {
    /// Whether the link is currently usable
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}

/// Link parameters
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Device path (e.g., /dev/ttyUSB0)
    pub port: String,
    pub baud_rate: u32,
    /// Pause after opening while the board resets
    pub settle_delay: Duration,
}

impl From<&SerialConfig> for LinkSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        }
    }
}

/// Accumulates one line across reads, bounded by [`MAX_LINE_LEN`]
///
/// A line that outgrows the bound is dropped up to and including its
/// terminating newline.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
    discarding: bool,
    discarded: u64,
}

impl LineBuffer {
    /// Read until a full line is held (`true`) or end of stream (`false`)
    ///
    /// Cancel safe: consumed bytes are recorded before the next await.
    async fn fill_from<R>(&mut self, reader: &mut R) -> std::io::Result<bool>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(false);
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let used = newline.map_or(available.len(), |i| i + 1);

            if !self.discarding {
                if self.bytes.len() + used > MAX_LINE_LEN {
                    warn!(
                        "Dropping line longer than {} bytes (wrong baud rate?)",
                        MAX_LINE_LEN
                    );
                    self.bytes.clear();
                    self.discarding = true;
                    self.discarded += 1;
                } else {
                    self.bytes.extend_from_slice(&available[..used]);
                }
            }
            reader.consume(used);

            if newline.is_some() {
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                return Ok(true);
            }
        }
    }

    /// Decoded, trimmed line; clears the buffer
    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.bytes).trim().to_string();
        self.bytes.clear();
        line
    }

    fn clear(&mut self) {
        self.bytes.clear();
        self.discarding = false;
    }
}

/// Connection Manager
///
/// Exclusive owner of the physical link. All transitions take `&mut self`,
/// so they are serialized by construction.
pub struct ConnectionManager {
    opener: Arc<dyn PortOpener>,
    settings: LinkSettings,
    link: Option<BufReader<BoxedPort>>,
    /// Line not yet terminated; survives read timeouts
    line: LineBuffer,
    state: LinkState,
    consecutive_failures: u32,
    last_activity: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("port", &self.settings.port)
            .field("baud_rate", &self.settings.baud_rate)
            .field("state", &self.state)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager in the Disconnected state. No I/O is performed.
    pub fn new(opener: Arc<dyn PortOpener>, settings: LinkSettings) -> Self {
        Self {
            opener,
            settings,
            link: None,
            line: LineBuffer::default(),
            state: LinkState::Disconnected,
            consecutive_failures: 0,
            last_activity: None,
        }
    }

    /// Acquire the link and wait for the board to settle
    ///
    /// Opening the port resets the board, so the manager sleeps for
    /// `settle_delay` before reporting Connected.
    ///
    /// # Returns
    ///
    /// * `Result<()>` - Connected, or already was
    ///
    /// # Errors
    ///
    /// Returns the opener's error when the port cannot be acquired (the
    /// manager stays Disconnected), or `NotConnected` after `stop`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use mbot_gateway::serial::port_trait::TokioSerialOpener;
    /// use mbot_gateway::serial::{ConnectionManager, LinkSettings};
    ///
    /// # async fn example() -> mbot_gateway::error::Result<()> {
    /// let settings = LinkSettings {
    ///     port: "/dev/ttyUSB0".to_string(),
    ///     baud_rate: 115_200,
    ///     settle_delay: Duration::from_secs(2),
    /// };
    /// let mut conn = ConnectionManager::new(Arc::new(TokioSerialOpener), settings);
    ///
    /// conn.open().await?;
    /// if let Some(line) = conn.read_line(Duration::from_secs(1)).await? {
    ///     println!("{}", line);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(&mut self) -> Result<()> {
        match self.state {
            LinkState::Stopped => return Err(GatewayError::NotConnected),
            LinkState::Connected => return Ok(()),
            LinkState::Disconnected | LinkState::Connecting => {}
        }

        self.state = LinkState::Connecting;
        debug!("Opening serial port {}", self.settings.port);

        let port = match self
            .opener
            .open(&self.settings.port, self.settings.baud_rate)
            .await
        {
            Ok(port) => port,
            Err(e) => {
                self.state = LinkState::Disconnected;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                return Err(e);
            }
        };

        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        self.link = Some(BufReader::new(port));
        self.line.clear();
        self.state = LinkState::Connected;
        self.consecutive_failures = 0;
        self.last_activity = Some(Utc::now());

        info!(
            "Connected to device on {} at {} baud",
            self.settings.port, self.settings.baud_rate
        );
        Ok(())
    }

    /// Release the link if held. Safe to call in any state.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            info!("Disconnected from device on {}", self.settings.port);
        }
        self.line.clear();
        if self.state != LinkState::Stopped {
            self.state = LinkState::Disconnected;
        }
    }

    /// Close the link and refuse any further transitions
    pub fn stop(&mut self) {
        self.close();
        self.state = LinkState::Stopped;
    }

    /// Whether a link is held
    pub fn is_open(&self) -> bool {
        self.state == LinkState::Connected && self.link.is_some()
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Snapshot for status reporting
    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            port: self.settings.port.clone(),
            baud_rate: self.settings.baud_rate,
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_activity: self.last_activity,
        }
    }

    /// Write a single control byte
    ///
    /// # Errors
    ///
    /// `NotConnected` when no link is held; `LinkFault` when the write fails,
    /// in which case the link is dropped.
    pub async fn send_command(&mut self, byte: u8) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            debug!("Dropping command 0x{:02X}: not connected", byte);
            return Err(GatewayError::NotConnected);
        };

        let written = async {
            link.write_all(&[byte]).await?;
            link.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.last_activity = Some(Utc::now());
                debug!("Sent command byte 0x{:02X}", byte);
                Ok(())
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    /// Wait up to `timeout` for one line
    ///
    /// Returns `Ok(None)` when the timeout elapses first. Bytes received
    /// before the timeout are kept and completed by the next call. Lines
    /// longer than [`MAX_LINE_LEN`] are dropped whole. The returned line is
    /// trimmed and decoded as lossy UTF-8.
    ///
    /// # Errors
    ///
    /// `NotConnected` when no link is held; `LinkFault` on an I/O error or
    /// end of stream, in which case the link is dropped.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let Some(link) = self.link.as_mut() else {
            return Err(GatewayError::NotConnected);
        };

        let read = tokio::time::timeout(timeout, self.line.fill_from(link)).await;

        match read {
            Err(_elapsed) => Ok(None),
            Ok(Ok(true)) => {
                let line = self.line.take();
                self.last_activity = Some(Utc::now());
                Ok(Some(line))
            }
            // Zero bytes, or a partial line cut off by end of stream
            Ok(Ok(false)) => Err(self.fault(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "serial stream closed",
            ))),
            Ok(Err(e)) => Err(self.fault(e)),
        }
    }

    /// Overlong lines dropped since the manager was created
    pub fn discarded_lines(&self) -> u64 {
        self.line.discarded
    }

    fn fault(&mut self, error: std::io::Error) -> GatewayError {
        warn!("Serial link on {} lost: {}", self.settings.port, error);
        self.close();
        GatewayError::LinkFault(error)
    }
}
