//! Backing Store Adapters
//!
//! Generic refresh sources for stores that can be read in full, plus an
//! in-memory store for demos and tests.

mod memory;
mod snapshot;

pub use memory::MemoryStore;
pub use snapshot::{SnapshotRefresher, SnapshotSource};
