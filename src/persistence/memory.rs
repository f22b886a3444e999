//! In-memory snapshot store
//!
//! Keeps the last saved snapshot in process memory. Availability can be
//! toggled to exercise persistence failure paths.

use crate::domain::ports::{Snapshot, SnapshotStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Snapshot store that never touches disk
#[derive(Debug)]
pub struct MemorySnapshotStore {
    snapshot: RwLock<Option<Snapshot>>,
    available: AtomicBool,
    saves: AtomicU64,
}

impl MemorySnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
            available: AtomicBool::new(true),
            saves: AtomicU64::new(0),
        }
    }

    /// Create a store pre-populated with a snapshot
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        *store.snapshot.write() = Some(snapshot);
        store
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Last saved snapshot, if any
    pub fn current(&self) -> Option<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.read().clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(Error::Persistence("memory store unavailable".to_string()));
        }
        *self.snapshot.write() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
