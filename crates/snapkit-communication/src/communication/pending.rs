//! Pending request table
//!
//! Maps request ids to the resolver waiting on the response. Indexed frames
//! carry the id on the wire; version 0 frames are matched to the oldest entry
//! expecting the same response key. Entries past their deadline are evicted,
//! which resolves the waiter with an abandoned error.

use crate::protocol::{ParsedFrame, ResponseKey};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

struct PendingEntry {
    id: u32,
    key: ResponseKey,
    deadline: Instant,
    resolver: oneshot::Sender<ParsedFrame>,
}

/// Outstanding requests of one link
pub struct PendingRequests {
    next_id: AtomicU32,
    entries: Mutex<Vec<PendingEntry>>,
}

impl PendingRequests {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a request id without registering a waiter
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a waiter for `key`; returns its id and the receiving half
    pub fn register(
        &self,
        key: ResponseKey,
        timeout: Duration,
    ) -> (u32, oneshot::Receiver<ParsedFrame>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.entries.lock().push(PendingEntry {
            id,
            key,
            deadline: Instant::now() + timeout,
            resolver: tx,
        });
        (id, rx)
    }

    /// Resolve the entry with this id
    pub fn resolve_id(&self, id: u32, frame: ParsedFrame) -> Result<(), ParsedFrame> {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.iter().position(|e| e.id == id) {
                Some(pos) => entries.remove(pos),
                None => return Err(frame),
            }
        };
        entry.resolver.send(frame)
    }

    /// Resolve the oldest entry whose key matches the frame
    pub fn resolve_oldest(&self, frame: ParsedFrame) -> Result<(), ParsedFrame> {
        let entry = {
            let mut entries = self.entries.lock();
            match entries
                .iter()
                .position(|e| e.key.matches(frame.event_id, &frame.content))
            {
                Some(pos) => entries.remove(pos),
                None => return Err(frame),
            }
        };
        entry.resolver.send(frame)
    }

    /// Drop an entry whose waiter gave up
    pub fn remove(&self, id: u32) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Evict entries past their deadline
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.deadline > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} expired pending request(s)", evicted);
        }
        evicted
    }

    /// Abandon every outstanding request
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("outstanding", &self.len())
            .finish()
    }
}
