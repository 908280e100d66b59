//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{GatewayError, Result};

/// Byte stream to and from the device
///
/// Anything readable and writable qualifies: a real `SerialStream` in
/// production, an in-memory duplex pipe in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SerialPortIO for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// An opened link, type-erased
pub type BoxedPort = Box<dyn SerialPortIO>;

/// Acquires the physical link
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `path` at `baud_rate`
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedPort>;
}

/// Opens real serial ports through `tokio-serial` (8N1, no flow control)
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialOpener;

impl TokioSerialOpener {
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| GatewayError::Serial(format!("Failed to open {}: {}", path, e)))
    }
}

#[async_trait]
impl PortOpener for TokioSerialOpener {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedPort> {
        let port = Self::open_port(path, baud_rate)?;
        Ok(Box::new(port))
    }
}
