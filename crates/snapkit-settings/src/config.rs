//! Configuration management for SnapKit
//!
//! Configuration is organized into sections:
//! - Connection settings (transport defaults, baud rate, HTTP port, timeouts)
//! - Heartbeat timing for networked machines
//! - Discovery (broadcast target, listen window, scan timeout)
//!
//! Files are JSON or TOML, chosen by extension. Missing sections and keys fall
//! back to their defaults.

use crate::error::{ConfigError, SettingsResult};
use serde::{Deserialize, Serialize};
use snapkit_core::{ConnectionType, ProtocolVersion};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Transport offered first in the UI
    pub connection_type: ConnectionType,
    /// Baud rate for serial machines
    pub baud_rate: u32,
    /// Controller API port of networked machines
    pub http_port: u16,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Serial frame layout
    pub protocol: ProtocolVersion,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Serial,
            baud_rate: 115_200,
            http_port: 8080,
            request_timeout_ms: 5000,
            protocol: ProtocolVersion::V0,
        }
    }
}

impl ConnectionSettings {
    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Heartbeat timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Delay before the first status poll, in milliseconds
    pub initial_delay_ms: u64,
    /// Delay between polls, in milliseconds
    pub interval_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            interval_ms: 1000,
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// The scanning flag clears after this long without a result, in milliseconds
    pub scan_timeout_ms: u64,
    /// Destination of discovery datagrams
    pub broadcast_address: String,
    /// Port machines listen on for discovery datagrams
    pub broadcast_port: u16,
    /// How long replies are collected, in milliseconds
    pub listen_window_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 3000,
            broadcast_address: Ipv4Addr::BROADCAST.to_string(),
            broadcast_port: 20054,
            listen_window_ms: 1000,
        }
    }
}

impl DiscoverySettings {
    /// Parsed broadcast address
    pub fn broadcast_ip(&self) -> SettingsResult<Ipv4Addr> {
        self.broadcast_address.parse().map_err(|e: std::net::AddrParseError| {
            ConfigError::InvalidValue {
                key: "discovery.broadcast_address".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Heartbeat timing
    pub heartbeat: HeartbeatSettings,
    /// Discovery settings
    pub discovery: DiscoverySettings,
}

enum Format {
    Json,
    Toml,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("toml") => Ok(Format::Toml),
        other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("<none>").to_string()).into()),
    }
}

fn ensure_positive(key: &str, value: u64) -> SettingsResult<()> {
    if value == 0 {
        return Err(ConfigError::ValueOutOfRange {
            key: key.to_string(),
            value: value.to_string(),
        }
        .into());
    }
    Ok(())
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path)?;

        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match format_of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, content)?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        ensure_positive("connection.baud_rate", u64::from(self.connection.baud_rate))?;
        ensure_positive("connection.http_port", u64::from(self.connection.http_port))?;
        ensure_positive("connection.request_timeout_ms", self.connection.request_timeout_ms)?;

        ensure_positive("heartbeat.interval_ms", self.heartbeat.interval_ms)?;

        ensure_positive("discovery.scan_timeout_ms", self.discovery.scan_timeout_ms)?;
        ensure_positive("discovery.broadcast_port", u64::from(self.discovery.broadcast_port))?;
        ensure_positive("discovery.listen_window_ms", self.discovery.listen_window_ms)?;
        self.discovery.broadcast_ip()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SettingsError;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.baud_rate, 115_200);
        assert_eq!(config.connection.http_port, 8080);
        assert_eq!(config.heartbeat.interval_ms, 1000);
        assert_eq!(config.discovery.broadcast_port, 20054);
        assert_eq!(
            config.discovery.broadcast_ip().unwrap(),
            Ipv4Addr::BROADCAST
        );
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            baud_rate = 250000
            protocol = "indexed"
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.baud_rate, 250_000);
        assert_eq!(config.connection.protocol, ProtocolVersion::Indexed);
        assert_eq!(config.connection.http_port, 8080);
        assert_eq!(config.heartbeat, HeartbeatSettings::default());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Config::default();
        config.connection.request_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::Config(ConfigError::ValueOutOfRange { .. }))
        ));

        let mut config = Config::default();
        config.discovery.broadcast_address = "not-an-ip".into();
        assert!(matches!(
            config.validate(),
            Err(SettingsError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
