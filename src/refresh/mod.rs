//! Refresh Pipeline
//!
//! A [`DataRefresher`] polls a backing store through its [`Refreshable`]
//! source and broadcasts what changed. Listeners (the cache itself, sorters,
//! indexers, user code) each process the broadcast on their own worker.
//!
//! ```text
//! ┌──────────────┐ events ┌───────────┐      ┌──────────────────┐
//! │ Refreshable  │───────▶│   Topic   │─────▶│ listener workers │
//! └──────────────┘        └───────────┘      └────────┬─────────┘
//!                               ▲    marker acks      │
//!                               └─────────────────────┘
//!                          ListenerMarker (barrier)
//! ```

mod listener;
mod marker;
mod refresher;
mod topic;

pub use listener::{ListenerId, RefreshListener};
pub use marker::ListenerMarker;
pub use refresher::{DataRefresher, NoopRefresher, Publisher, Refreshable};
pub use topic::Topic;

pub(crate) use listener::panic_message;
