//! Secondary Indices
//!
//! Structures derived from the objects of a cache and kept in step with it by
//! listening to the same refresher.
//!
//! - [`Sorter`] - ordered view keyed by a sort value
//! - [`Indexer`] - hashed view grouping objects by a (non-unique) key
//!
//! Each structure owns its own lock, so readers of one structure never wait on
//! updates of another. A structure is attached to at most one refresher at a
//! time.

mod indexer;
#[cfg(test)]
mod proptest;
mod sort_key;
mod sorter;

pub use indexer::Indexer;
pub use sort_key::{DescendingLong, SortKey, TieBreaker};
pub use sorter::Sorter;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::{PersistentObject, RefreshEvent};
use crate::error::{Error, Result};
use crate::refresh::{DataRefresher, ListenerId, RefreshListener};

/// Operations the cache needs on any secondary structure, independent of
/// its key type.
pub(crate) trait SecondaryIndex<O: PersistentObject>: Send + Sync {
    /// Human readable label, e.g. `sorter by-name`.
    fn label(&self) -> String;

    /// Derive an entry for `object`, replacing whatever was there for its id.
    fn put(&self, object: Arc<O>);

    /// Drop the entry for `id`, if any.
    fn remove(&self, id: &O::Id);

    /// Start recording which ids receive updates until [`seed`](Self::seed).
    fn begin_seed(&self);

    /// Load a snapshot, skipping ids updated since [`begin_seed`](Self::begin_seed).
    /// Returns the number of snapshot entries processed.
    fn seed(&self, snapshot: &[Arc<O>]) -> usize;

    /// Listener registration of this structure.
    fn binding(&self) -> &Binding;

    /// Detach from `refresher`.
    fn unbind(&self, refresher: &DataRefresher<O>) -> Result<()>;

    /// Objects in the structure's natural order.
    fn values(&self) -> Vec<Arc<O>>;

    /// Number of objects held.
    fn len(&self) -> usize;
}

/// Applies refresh events to a secondary structure.
pub(crate) struct IndexListener<O: PersistentObject> {
    target: Arc<dyn SecondaryIndex<O>>,
}

impl<O: PersistentObject> RefreshListener<O> for IndexListener<O> {
    fn on_event(&self, event: &RefreshEvent<O>) -> Result<()> {
        match event {
            RefreshEvent::Created { object, .. } | RefreshEvent::Changed { object, .. } => {
                self.target.put(Arc::clone(object))
            }
            RefreshEvent::Deleted { id, .. } => self.target.remove(id),
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.target.label()
    }
}

/// Tracks the single listener registration of a structure.
#[derive(Debug, Default)]
pub(crate) struct Binding {
    listener: Mutex<Option<ListenerId>>,
}

impl Binding {
    pub(crate) fn bind<O: PersistentObject>(
        &self,
        target: Arc<dyn SecondaryIndex<O>>,
        refresher: &DataRefresher<O>,
    ) -> Result<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Err(Error::AlreadyBound(target.label()));
        }
        *listener = Some(refresher.add_listener(Arc::new(IndexListener { target }))?);
        Ok(())
    }

    pub(crate) fn unbind<O: PersistentObject>(
        &self,
        label: String,
        refresher: &DataRefresher<O>,
    ) -> Result<()> {
        let id = self
            .listener
            .lock()
            .take()
            .ok_or(Error::NotBound(label))?;
        refresher.remove_listener(id)
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.listener.lock().is_some()
    }
}
