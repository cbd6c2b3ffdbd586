//! dbsync - Refreshable In-Memory Object Cache
//!
//! Keeps an in-memory copy of objects that live in an external store, together
//! with any number of sorted and hashed secondary views, and keeps all of them
//! consistent as the store changes.
//!
//! # Architecture
//!
//! A refresher detects changes and publishes them as events. Every consumer
//! (the cache map, each sorter, each indexer) has its own queue and worker, so
//! consumers are updated in publish order without holding each other up:
//!
//! ```text
//! Refreshable (Eyes) → DataRefresher/Topic (Fan-out) → Cache + Sorters + Indexers (State)
//! ```
//!
//! A barrier ([`DataRefresher::wait_for_listeners`]) waits until everything
//! published so far has been applied everywhere.
//!
//! # Modules
//!
//! - [`cache`] - The cache, its builders and the MRU variant
//! - [`clock`] - Injectable time source
//! - [`domain`] - Persistent object traits and refresh events
//! - [`error`] - Error types
//! - [`index`] - Sorters and indexers
//! - [`lifecycle`] - Shutdown hooks
//! - [`refresh`] - Topic, barrier and refresher
//! - [`source`] - Snapshot based refresh sources and an in-memory store

pub mod cache;
pub mod clock;
pub mod domain;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod refresh;
pub mod source;

// Re-export commonly used types
pub use cache::{
    CacheBuilder, CacheSettings, CacheStats, MruCache, MruCacheBuilder, PersistentObjectCache,
    PromotionStrategy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    EventKind, PersistentObject, PersistentObjectLookup, RefreshEvent, RefreshResults,
};
pub use error::{Error, Result};
pub use index::{DescendingLong, Indexer, SortKey, Sorter};
pub use lifecycle::{ShutdownHooks, WithShutdown};
pub use refresh::{DataRefresher, Publisher, RefreshListener, Refreshable};
pub use source::{MemoryStore, SnapshotRefresher, SnapshotSource};

/// Crate version, as reported by the demo binary.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
