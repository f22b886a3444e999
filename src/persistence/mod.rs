//! Snapshot Persistence
//!
//! Implementations of [`SnapshotStore`](crate::domain::SnapshotStore):
//! a file-backed store for production and an in-memory store for tests
//! and ephemeral deployments.

mod file;
mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;
