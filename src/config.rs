//! # Configuration Management
//!
//! Centralized configuration for clients, servers and both transports.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`TAGWIRE_*` variables)
//!
//! Durations are written as integer milliseconds.

use crate::core::packet::MAX_PACKET_SIZE;
use crate::error::{NetError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default socket read buffer for stream sessions
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Largest datagram the UDP engine will put on the wire by default
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1400;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| NetError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| NetError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| NetError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults with `TAGWIRE_*` environment overrides applied.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TAGWIRE_SERVER_ADDRESS") {
            config.server.address = addr.clone();
            config.client.address = addr;
        }

        if let Ok(max) = std::env::var("TAGWIRE_MAX_PEERS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_peers = val;
            }
        }

        if let Ok(timeout) = std::env::var("TAGWIRE_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("TAGWIRE_REQUEST_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.request_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NetError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| NetError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of connected peers; later attempts are answered `Full`
    pub max_peers: usize,

    /// Capacity of each session's inbound dispatch queue
    pub backpressure_limit: usize,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_peers: 1000,
            backpressure_limit: 32,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.max_peers == 0 {
            errors.push("Max peers must be greater than 0".to_string());
        } else if self.max_peers > 100_000 {
            errors.push(format!(
                "Max peers very high: {} (ensure system resources can support this)",
                self.max_peers
            ));
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        } else if self.backpressure_limit > 1_000_000 {
            errors.push(format!(
                "Backpressure limit too large: {} (max recommended: 1,000,000)",
                self.backpressure_limit
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Default timeout for `request` when the caller does not pass one
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Capacity of the client session's inbound dispatch queue
    #[serde(default = "default_client_backpressure")]
    pub backpressure_limit: usize,
}

fn default_client_backpressure() -> usize {
    32
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            request_timeout: Duration::from_secs(10),
            backpressure_limit: default_client_backpressure(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:8080')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if self.backpressure_limit == 0 {
            errors.push("Client backpressure limit must be greater than 0".to_string());
        }

        errors
    }
}

/// Transport tuning shared by the stream and datagram sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Size of the fixed socket read buffer (TCP)
    pub read_buffer_size: usize,

    /// Largest encoded engine datagram (UDP)
    pub max_datagram_size: usize,

    /// Interval between keep-alive pings (UDP)
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Silence after which a peer is considered gone (UDP)
    #[serde(with = "duration_serde")]
    pub disconnect_timeout: Duration,

    /// Delay before an unacknowledged reliable datagram is re-sent (UDP)
    #[serde(with = "duration_serde")]
    pub resend_interval: Duration,

    /// Re-sends before the peer is disconnected with `Timeout` (UDP)
    pub max_resends: u32,

    /// Shared key a UDP client must present to be accepted
    #[serde(default)]
    pub connection_key: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            ping_interval: timeout::KEEPALIVE_INTERVAL,
            disconnect_timeout: Duration::from_secs(5),
            resend_interval: Duration::from_millis(100),
            max_resends: 50,
            connection_key: String::new(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.read_buffer_size < 64 {
            errors.push("Read buffer size too small (minimum: 64 bytes)".to_string());
        } else if self.read_buffer_size > MAX_PACKET_SIZE * 16 {
            errors.push(format!(
                "Read buffer size too large: {} bytes (maximum: {})",
                self.read_buffer_size,
                MAX_PACKET_SIZE * 16
            ));
        }

        if self.max_datagram_size < 64 {
            errors.push("Max datagram size too small (minimum: 64 bytes)".to_string());
        } else if self.max_datagram_size > MAX_PACKET_SIZE {
            errors.push(format!(
                "Max datagram size too large: {} bytes (maximum: {MAX_PACKET_SIZE})",
                self.max_datagram_size
            ));
        }

        if self.ping_interval.as_millis() < 10 {
            errors.push("Ping interval too short (minimum: 10ms)".to_string());
        }

        if self.disconnect_timeout <= self.ping_interval {
            errors.push("Disconnect timeout must be longer than the ping interval".to_string());
        }

        if self.resend_interval.as_millis() < 1 {
            errors.push("Resend interval must be at least 1ms".to_string());
        }

        if self.max_resends == 0 {
            errors.push("Max resends must be greater than 0".to_string());
        }

        if self.connection_key.len() > 256 {
            errors.push("Connection key too long (maximum: 256 bytes)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Level used when `RUST_LOG` is not set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("tagwire"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [server]
            address = "0.0.0.0:7000"
            max_peers = 4
            backpressure_limit = 8
            shutdown_timeout = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.max_peers, 4);
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.client.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn example_config_parses_back() {
        let text = NetworkConfig::example_config();
        let config = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(config.logging.log_level, Level::INFO);
        assert_eq!(config.transport.max_resends, 50);
    }
}
