//! Domain Layer
//!
//! The objects that are cached and the events that describe how they change.
//!
//! - **Ports** (`ports.rs`) - the entity contract and the lookup collaborator
//! - **Events** (`events.rs`) - refresh events and refresh result summaries

pub mod events;
pub mod ports;

pub use events::{Counter, EventKind, RefreshEvent, RefreshResults};
pub use ports::{PersistentObject, PersistentObjectLookup};
