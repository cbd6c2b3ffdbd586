//! Persistent Object Cache
//!
//! The cache, its builders and the background machinery that keeps it fresh.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  tick   ┌───────────────┐  events  ┌────────────────────┐
//! │  Scheduler   │────────▶│ DataRefresher │─────────▶│ cache map          │
//! └──────────────┘         └───────────────┘    │     ├────────────────────┤
//!                                               ├────▶│ sorters            │
//! ┌──────────────┐  seed                        └────▶│ indexers           │
//! │   Seeder     │───────────────────────────────────▶│ (new structures)   │
//! └──────────────┘                                    └────────────────────┘
//! ```
//!
//! - [`PersistentObjectCache`] - id-keyed cache with named sorts and indices
//! - [`MruCache`] - cache with a built-in most-recently-used ordering
//! - [`CacheBuilder`] / [`MruCacheBuilder`] - fluent construction
//! - [`CacheSettings`] - serializable configuration

mod builder;
mod config;
mod mru;
mod scheduler;
mod seeder;
mod stats;
mod store;

pub use builder::{CacheBuilder, MruCacheBuilder};
pub use config::CacheSettings;
pub use mru::{
    MruCache, PromoteNever, PromoteWhenNewOnly, PromoteWhenNewOrUpdated, Promotion,
    PromotionStrategy, MRU_SORT_ID,
};
pub use seeder::SeedHandle;
pub use stats::CacheStats;
pub use store::PersistentObjectCache;
