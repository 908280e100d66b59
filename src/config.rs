//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every key has a default, so an empty file (or no file at all) yields a
//! working configuration for a board on `/dev/ttyUSB0`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Log every Nth consecutive open failure
    #[serde(default = "default_failure_log_every")]
    pub failure_log_every: u32,
}

/// Acquisition pipeline configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AcquisitionConfig {
    /// Rate the firmware logs at; informational only
    #[serde(default = "default_sampling_rate_hz")]
    pub sampling_rate_hz: u32,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_persist_queue_capacity")]
    pub persist_queue_capacity: usize,

    #[serde(default = "default_log_every_records")]
    pub log_every_records: u64,
}

/// Persistence configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,

    /// Trailing window for averaged statistics
    #[serde(default = "default_stats_window_minutes")]
    pub stats_window_minutes: u32,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file in addition to stdout
    #[serde(default)]
    pub file: Option<String>,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { 115200 }
fn default_read_timeout_ms() -> u64 { 1000 }
fn default_reconnect_interval_ms() -> u64 { 5000 }
fn default_settle_delay_ms() -> u64 { 2000 }
fn default_failure_log_every() -> u32 { 12 }

fn default_sampling_rate_hz() -> u32 { 10 }
fn default_buffer_capacity() -> usize { 1000 }
fn default_persist_queue_capacity() -> usize { 1024 }
fn default_log_every_records() -> u64 { 1000 }

fn default_database_path() -> String { "data/mbot_data.db".to_string() }
fn default_retention_days() -> u32 { 30 }
fn default_cleanup_interval_hours() -> u64 { 24 }
fn default_stats_window_minutes() -> u32 { 60 }

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_http_port() -> u16 { 5000 }
fn default_cors_enabled() -> bool { true }

fn default_log_level() -> String { "info".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            failure_log_every: default_failure_log_every(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: default_sampling_rate_hz(),
            buffer_capacity: default_buffer_capacity(),
            persist_queue_capacity: default_persist_queue_capacity(),
            log_every_records: default_log_every_records(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            retention_days: default_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            stats_window_minutes: default_stats_window_minutes(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            cors_enabled: default_cors_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl StorageConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours.saturating_mul(3600))
    }

    pub fn stats_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stats_window_minutes))
    }
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::InvalidConfig(message.into())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mbot_gateway::config::Config;
    ///
    /// let config = Config::load("config/gateway.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first out-of-range value
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if ![9600, 19200, 38400, 57600, 115200, 230400].contains(&self.serial.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 19200, 38400, 57600, 115200, 230400",
            ));
        }

        if self.serial.read_timeout_ms == 0 || self.serial.read_timeout_ms > 10000 {
            return Err(invalid("read_timeout_ms must be between 1 and 10000"));
        }

        if self.serial.reconnect_interval_ms == 0 || self.serial.reconnect_interval_ms > 60000 {
            return Err(invalid("reconnect_interval_ms must be between 1 and 60000"));
        }

        if self.serial.settle_delay_ms > 10000 {
            return Err(invalid("settle_delay_ms must be at most 10000"));
        }

        if self.serial.failure_log_every == 0 {
            return Err(invalid("failure_log_every must be greater than 0"));
        }

        if self.acquisition.sampling_rate_hz == 0 || self.acquisition.sampling_rate_hz > 1000 {
            return Err(invalid("sampling_rate_hz must be between 1 and 1000"));
        }

        if self.acquisition.buffer_capacity == 0 {
            return Err(invalid("buffer_capacity must be greater than 0"));
        }

        if self.acquisition.persist_queue_capacity == 0 {
            return Err(invalid("persist_queue_capacity must be greater than 0"));
        }

        if self.acquisition.log_every_records == 0 {
            return Err(invalid("log_every_records must be greater than 0"));
        }

        if self.storage.database_path.is_empty() {
            return Err(invalid("database_path cannot be empty"));
        }

        if self.storage.retention_days == 0 || self.storage.retention_days > 36500 {
            return Err(invalid("retention_days must be between 1 and 36500"));
        }

        if self.storage.cleanup_interval_hours == 0 || self.storage.cleanup_interval_hours > 8760 {
            return Err(invalid("cleanup_interval_hours must be between 1 and 8760"));
        }

        if self.storage.stats_window_minutes == 0 {
            return Err(invalid("stats_window_minutes must be greater than 0"));
        }

        if self.logging.level.is_empty() {
            return Err(invalid("logging level cannot be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.serial.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.serial.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.acquisition.buffer_capacity, 1000);
        assert_eq!(config.acquisition.sampling_rate_hz, 10);
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.storage.cleanup_interval(), Duration::from_secs(86400));
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.serial.port, default_serial_port());
        assert_eq!(config.storage.database_path, default_database_path());
        assert!(config.server.cors_enabled);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = Config::from_toml(include_str!("../config/gateway.toml")).unwrap();
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.logging.file.as_deref(), Some("gateway.log"));
    }

    #[test]
    fn test_partial_section() {
        let config = Config::from_toml(
            r#"
[serial]
port = "/dev/ttyACM0"

[acquisition]
buffer_capacity = 50
"#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, default_baud_rate());
        assert_eq!(config.acquisition.buffer_capacity, 50);
        assert_eq!(config.acquisition.persist_queue_capacity, 1024);
    }

    #[test]
    fn test_invalid_toml() {
        let result = Config::from_toml("[serial\nport = 1");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_empty_port_rejected() {
        let mut config = Config::default();
        config.serial.port = String::new();
        assert!(matches!(config.validate(), Err(GatewayError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_baud_rate() {
        let mut config = Config::default();
        config.serial.baud_rate = 420000;
        assert!(config.validate().is_err());

        config.serial.baud_rate = 9600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_timing() {
        let mut config = Config::default();
        config.serial.read_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.reconnect_interval_ms = 60001;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.settle_delay_ms = 0;
        assert!(config.validate().is_ok());
        config.serial.settle_delay_ms = 10001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacities_rejected() {
        let mut config = Config::default();
        config.acquisition.buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.acquisition.persist_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.failure_log_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_limits() {
        let mut config = Config::default();
        config.storage.retention_days = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.cleanup_interval_hours = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.database_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_upper_bounds() {
        let result = Config::from_toml("[storage]\ncleanup_interval_hours = 9223372036854775807");
        assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));

        let result = Config::from_toml("[storage]\nretention_days = 4000000000");
        assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));

        let config =
            Config::from_toml("[storage]\ncleanup_interval_hours = 8760\nretention_days = 36500")
                .unwrap();
        assert_eq!(
            config.storage.cleanup_interval(),
            Duration::from_secs(8760 * 3600)
        );
    }

    #[test]
    fn test_cleanup_interval_saturates() {
        let storage = StorageConfig {
            cleanup_interval_hours: u64::MAX,
            ..StorageConfig::default()
        };
        assert_eq!(storage.cleanup_interval(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_retention_durations() {
        let storage = StorageConfig::default();
        assert_eq!(storage.retention(), chrono::Duration::days(30));
        assert_eq!(storage.stats_window(), chrono::Duration::hours(1));
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[serial]
port = "/dev/ttyUSB1"
baud_rate = 57600

[storage]
database_path = "/tmp/mbot.db"
retention_days = 7

[server]
port = 8080

[logging]
level = "debug"
file = "/tmp/gateway.log"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baud_rate, 57600);
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.file.as_deref(), Some("/tmp/gateway.log"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/gateway.toml");
        assert!(matches!(result, Err(GatewayError::Io(_))));
    }

    #[test]
    fn test_load_file_with_invalid_values() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[acquisition]\nbuffer_capacity = 0\n")
            .unwrap();
        temp_file.flush().unwrap();

        assert!(matches!(
            Config::load(temp_file.path()),
            Err(GatewayError::InvalidConfig(_))
        ));
    }
}
