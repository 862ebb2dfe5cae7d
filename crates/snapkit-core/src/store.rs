//! Persistence seam for saved connection credentials
//!
//! The session remembers the last machine it connected to so the UI can offer
//! a one-click reconnect after a restart. Where that record lives is up to the
//! embedding application; the settings crate provides a file-backed store.

use crate::data::SavedConnection;
use crate::error::Result;
use parking_lot::Mutex;

/// Storage for the saved connection record
pub trait SavedConnectionStore: Send + Sync {
    /// Load the saved record, or an empty one if nothing was saved
    fn load(&self) -> Result<SavedConnection>;

    /// Replace the saved record
    fn save(&self, saved: &SavedConnection) -> Result<()>;
}

/// In-memory store, used when nothing should touch disk
#[derive(Debug, Default)]
pub struct MemoryConnectionStore {
    saved: Mutex<SavedConnection>,
}

impl MemoryConnectionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a record
    pub fn with_saved(saved: SavedConnection) -> Self {
        Self {
            saved: Mutex::new(saved),
        }
    }
}

impl SavedConnectionStore for MemoryConnectionStore {
    fn load(&self) -> Result<SavedConnection> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, saved: &SavedConnection) -> Result<()> {
        *self.saved.lock() = saved.clone();
        Ok(())
    }
}
