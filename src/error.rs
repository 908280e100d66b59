//! # Error Types
//!
//! Custom error types for the mBot gateway using `thiserror`.

use thiserror::Error;

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Serial port could not be opened
    #[error("Serial error: {0}")]
    Serial(String),

    /// Operation requires an open link
    #[error("Serial link is not connected")]
    NotConnected,

    /// The open link reported an I/O failure or end of stream
    #[error("Serial link fault: {0}")]
    LinkFault(std::io::Error),

    /// Configuration file parse errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration values out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence store errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Persistence queue is full, record dropped
    #[error("Persistence queue is full")]
    QueueFull,

    /// The receiving side of a channel is gone
    #[error("Channel closed")]
    ChannelClosed,

    /// A measurement consumer rejected a record
    #[error("Consumer error: {0}")]
    Consumer(String),
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
