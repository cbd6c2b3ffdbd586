//! Refresh Events
//!
//! Immutable records of changes detected in the backing store. A refresher
//! publishes exactly one event per detected change; every listener of that
//! refresher receives the events in publish order.
//!
//! # Example
//!
//! ```ignore
//! let event = RefreshEvent::created(Arc::new(product));
//! publisher.publish(event);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::ports::PersistentObject;
use crate::refresh::ListenerId;

/// Kind of change a [`RefreshEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// New data was found (inserts)
    Created,
    /// Existing data was updated
    Changed,
    /// Data disappeared from the backing store
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => write!(f, "Created"),
            EventKind::Changed => write!(f, "Changed"),
            EventKind::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Event broadcast when the backing store of a refresher changed.
pub enum RefreshEvent<O: PersistentObject> {
    /// A new object was found.
    Created {
        object: Arc<O>,
        timestamp: DateTime<Utc>,
    },

    /// An existing object was updated.
    Changed {
        object: Arc<O>,
        timestamp: DateTime<Utc>,
    },

    /// An object was deleted; only its id is known.
    Deleted { id: O::Id, timestamp: DateTime<Utc> },
}

impl<O: PersistentObject> RefreshEvent<O> {
    /// Create a `Created` event stamped with the current time.
    pub fn created(object: impl Into<Arc<O>>) -> Self {
        RefreshEvent::Created {
            object: object.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a `Changed` event stamped with the current time.
    pub fn changed(object: impl Into<Arc<O>>) -> Self {
        RefreshEvent::Changed {
            object: object.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a `Deleted` event stamped with the current time.
    pub fn deleted(id: O::Id) -> Self {
        RefreshEvent::Deleted {
            id,
            timestamp: Utc::now(),
        }
    }

    /// The id of the subject of this event.
    pub fn id(&self) -> &O::Id {
        match self {
            RefreshEvent::Created { object, .. } | RefreshEvent::Changed { object, .. } => {
                object.id()
            }
            RefreshEvent::Deleted { id, .. } => id,
        }
    }

    /// The object carried by `Created` and `Changed` events.
    pub fn object(&self) -> Option<&Arc<O>> {
        match self {
            RefreshEvent::Created { object, .. } | RefreshEvent::Changed { object, .. } => {
                Some(object)
            }
            RefreshEvent::Deleted { .. } => None,
        }
    }

    /// When this event was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RefreshEvent::Created { timestamp, .. }
            | RefreshEvent::Changed { timestamp, .. }
            | RefreshEvent::Deleted { timestamp, .. } => *timestamp,
        }
    }

    /// The kind of change.
    pub fn kind(&self) -> EventKind {
        match self {
            RefreshEvent::Created { .. } => EventKind::Created,
            RefreshEvent::Changed { .. } => EventKind::Changed,
            RefreshEvent::Deleted { .. } => EventKind::Deleted,
        }
    }
}

impl<O: PersistentObject> Clone for RefreshEvent<O> {
    fn clone(&self) -> Self {
        match self {
            RefreshEvent::Created { object, timestamp } => RefreshEvent::Created {
                object: Arc::clone(object),
                timestamp: *timestamp,
            },
            RefreshEvent::Changed { object, timestamp } => RefreshEvent::Changed {
                object: Arc::clone(object),
                timestamp: *timestamp,
            },
            RefreshEvent::Deleted { id, timestamp } => RefreshEvent::Deleted {
                id: id.clone(),
                timestamp: *timestamp,
            },
        }
    }
}

impl<O: PersistentObject> fmt::Debug for RefreshEvent<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshEvent")
            .field("kind", &self.kind())
            .field("id", self.id())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}

// =============================================================================
// Topic Envelope
// =============================================================================

/// Id of a barrier marker round-trip.
pub(crate) type MarkerId = Uuid;

/// What actually travels through a listener queue. The marker variants are
/// only ever seen by the topic workers and the barrier, never by listeners.
pub(crate) enum Envelope<O: PersistentObject> {
    Data(RefreshEvent<O>),
    MarkerReq(MarkerId),
    MarkerAck { marker: MarkerId, sender: ListenerId },
}

impl<O: PersistentObject> Clone for Envelope<O> {
    fn clone(&self) -> Self {
        match self {
            Envelope::Data(event) => Envelope::Data(event.clone()),
            Envelope::MarkerReq(marker) => Envelope::MarkerReq(*marker),
            Envelope::MarkerAck { marker, sender } => Envelope::MarkerAck {
                marker: *marker,
                sender: *sender,
            },
        }
    }
}

impl<O: PersistentObject> fmt::Debug for Envelope<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Data(event) => event.fmt(f),
            Envelope::MarkerReq(marker) => write!(f, "Marker Request {{id={}}}", marker),
            Envelope::MarkerAck { marker, sender } => write!(
                f,
                "Marker Acknowledgement {{id={}, sender={}}}",
                marker, sender
            ),
        }
    }
}

// =============================================================================
// Refresh Results
// =============================================================================

/// Summary of the work done by one refresh run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshResults {
    /// Total number of records handled
    pub found: usize,
    /// Objects recognized as newly created
    pub created: usize,
    /// Objects recognized as changed
    pub changed: usize,
    /// Objects recognized as deleted
    pub deleted: usize,
    /// Load time in milliseconds (excludes listener processing)
    pub elapsed_millis: u64,
}

impl RefreshResults {
    /// Results of a refresh that found nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of objects that were created or changed.
    pub fn loaded(&self) -> usize {
        self.created + self.changed
    }

    /// True if the refresh detected no changes at all.
    pub fn is_empty(&self) -> bool {
        self.found == 0
    }
}

/// Helper for gathering results during a refresh.
#[derive(Debug, Clone)]
pub struct Counter {
    found: usize,
    created: usize,
    changed: usize,
    deleted: usize,
    start: Instant,
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    /// Start counting now.
    pub fn new() -> Self {
        Self {
            found: 0,
            created: 0,
            changed: 0,
            deleted: 0,
            start: Instant::now(),
        }
    }

    /// Count one event of the given kind.
    pub fn inc(&mut self, kind: EventKind) {
        self.found += 1;
        match kind {
            EventKind::Created => self.created += 1,
            EventKind::Changed => self.changed += 1,
            EventKind::Deleted => self.deleted += 1,
        }
    }

    /// Results so far, with the time elapsed since the counter was created.
    pub fn as_results(&self) -> RefreshResults {
        RefreshResults {
            found: self.found,
            created: self.created,
            changed: self.changed,
            deleted: self.deleted,
            elapsed_millis: self.start.elapsed().as_millis() as u64,
        }
    }
}
