//! Saved connection persistence
//!
//! Stores the record of the last successful connection as JSON so the UI can
//! offer a reconnect after a restart.

use crate::error::{SettingsError, SettingsResult};
use snapkit_core::{SavedConnection, SavedConnectionStore};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory name under the platform config dir
pub const APP_DIR_NAME: &str = "snapkit";

const CONNECTION_FILE_NAME: &str = "connection.json";

/// Platform config directory for SnapKit, created if missing
pub fn config_directory() -> SettingsResult<PathBuf> {
    let dir = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| {
            SettingsError::ConfigDirectory("no config or home directory on this platform".into())
        })?
        .join(APP_DIR_NAME);
    fs::create_dir_all(&dir)
        .map_err(|e| SettingsError::ConfigDirectory(format!("{}: {}", dir.display(), e)))?;
    Ok(dir)
}

/// Saved-connection store backed by a JSON file
#[derive(Debug, Clone)]
pub struct FileConnectionStore {
    path: PathBuf,
}

impl FileConnectionStore {
    /// Store at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store in the platform config directory
    pub fn in_config_dir() -> SettingsResult<Self> {
        Ok(Self::new(config_directory()?.join(CONNECTION_FILE_NAME)))
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> SettingsResult<SavedConnection> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SavedConnection::default()),
            Err(e) => Err(SettingsError::LoadError(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write(&self, saved: &SavedConnection) -> SettingsResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(saved)?;
        fs::write(&self.path, content)
            .map_err(|e| SettingsError::SaveError(format!("{}: {}", self.path.display(), e)))?;
        tracing::debug!("Saved connection to {} in {}", saved.name, self.path.display());
        Ok(())
    }
}

impl SavedConnectionStore for FileConnectionStore {
    fn load(&self) -> snapkit_core::Result<SavedConnection> {
        Ok(self.read()?)
    }

    fn save(&self, saved: &SavedConnection) -> snapkit_core::Result<()> {
        Ok(self.write(saved)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapkit_core::ConnectionType;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty_record() {
        let dir = TempDir::new().unwrap();
        let store = FileConnectionStore::new(dir.path().join("connection.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let store = FileConnectionStore::new(dir.path().join("nested/deeper/connection.json"));
        let saved = SavedConnection {
            connection_type: ConnectionType::WiFi,
            name: "A350".into(),
            address: "192.168.1.100".into(),
            port: String::new(),
            token: Some("t0k3n".into()),
        };

        store.save(&saved).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load().unwrap(), saved);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connection.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FileConnectionStore::new(path);
        assert!(store.load().is_err());
    }
}
