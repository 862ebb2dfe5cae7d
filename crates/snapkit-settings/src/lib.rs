//! SnapKit Settings Crate
//!
//! Configuration file handling and persistence of the saved connection record.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{Config, ConnectionSettings, DiscoverySettings, HeartbeatSettings};
pub use error::{ConfigError, SettingsError, SettingsResult};
pub use persistence::{config_directory, FileConnectionStore, APP_DIR_NAME};
