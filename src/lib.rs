//! # SnapKit
//!
//! Connection and protocol layer for Snapmaker CNC, laser and 3D-printing
//! machines reached over a serial port or the networked controller API.
//!
//! ## Architecture
//!
//! 1. **snapkit-core** - errors, data model, event bus, credential store seam
//! 2. **snapkit-communication** - frame codec, transports, agents, session, discovery
//! 3. **snapkit-settings** - configuration files and the saved-connection file
//! 4. **snapkit** - this crate: logging setup and the discovery CLI

pub use snapkit_communication::{
    agent, communication, discovery, protocol, session, AgentInfo, ConnectionSession,
    DiscoveryConfig, DiscoveryService, HeartbeatConfig, MachineAgent, ScanKind, Transport,
    TransportOptions,
};

pub use snapkit_core::{
    AppEvent, ConnectionError, ConnectionStatus, ConnectionType, ControllerError, Error,
    EventBus, ProtocolError, Result, SavedConnection, SavedConnectionStore,
};

pub use snapkit_settings::{Config, FileConnectionStore, SettingsError};

use std::time::Duration;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output with pretty formatting
/// - RUST_LOG environment variable support
/// - INFO as the default level
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Transport parameters from the connection section
pub fn transport_options(config: &Config) -> TransportOptions {
    TransportOptions {
        http_port: config.connection.http_port,
        request_timeout: config.connection.request_timeout(),
    }
}

/// Heartbeat timing from the heartbeat section
pub fn heartbeat_config(config: &Config) -> HeartbeatConfig {
    HeartbeatConfig {
        initial_delay: Duration::from_millis(config.heartbeat.initial_delay_ms),
        interval: Duration::from_millis(config.heartbeat.interval_ms),
    }
}

/// Discovery parameters from the discovery and connection sections
pub fn discovery_config(config: &Config) -> std::result::Result<DiscoveryConfig, SettingsError> {
    Ok(DiscoveryConfig {
        scan_timeout: Duration::from_millis(config.discovery.scan_timeout_ms),
        broadcast_address: config.discovery.broadcast_ip()?,
        broadcast_port: config.discovery.broadcast_port,
        listen_window: Duration::from_millis(config.discovery.listen_window_ms),
        baud_rate: config.connection.baud_rate,
        protocol: config.connection.protocol,
        transport: transport_options(config),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapkit_core::ProtocolVersion;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_config_matches_library_defaults() {
        let config = Config::default();
        assert_eq!(transport_options(&config), TransportOptions::default());
        assert_eq!(heartbeat_config(&config), HeartbeatConfig::default());
        assert_eq!(discovery_config(&config).unwrap(), DiscoveryConfig::default());
    }

    #[test]
    fn test_custom_sections_are_carried_over() {
        let mut config = Config::default();
        config.connection.protocol = ProtocolVersion::Indexed;
        config.connection.request_timeout_ms = 750;
        config.discovery.broadcast_address = "10.0.0.255".into();
        config.heartbeat.interval_ms = 250;

        let discovery = discovery_config(&config).unwrap();
        assert_eq!(discovery.protocol, ProtocolVersion::Indexed);
        assert_eq!(discovery.broadcast_address, Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(discovery.transport.request_timeout, Duration::from_millis(750));
        assert_eq!(heartbeat_config(&config).interval, Duration::from_millis(250));
    }
}
