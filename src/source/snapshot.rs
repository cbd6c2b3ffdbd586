//! Snapshot Refresher
//!
//! Turns a backing store that can only be read in full into a stream of
//! change events, by diffing every load against the previous one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::domain::{PersistentObject, RefreshResults};
use crate::error::Result;
use crate::refresh::{Publisher, Refreshable};

/// A backing store that can list everything it holds.
pub trait SnapshotSource<O: PersistentObject>: Send + Sync {
    /// Load the current contents of the store.
    fn load(&self) -> Result<Vec<Arc<O>>>;
}

impl<O: PersistentObject, T: SnapshotSource<O> + ?Sized> SnapshotSource<O> for Arc<T> {
    fn load(&self) -> Result<Vec<Arc<O>>> {
        (**self).load()
    }
}

/// [`Refreshable`] over a [`SnapshotSource`].
///
/// An object is Created when its id was not in the previous load, Changed
/// when it compares unequal to the previously loaded version, and Deleted
/// when its id disappeared. A failed load publishes nothing and leaves the
/// previous snapshot in place.
pub struct SnapshotRefresher<O: PersistentObject, S> {
    source: S,
    previous: Mutex<HashMap<O::Id, Arc<O>>>,
}

impl<O, S> SnapshotRefresher<O, S>
where
    O: PersistentObject + PartialEq,
    S: SnapshotSource<O>,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            previous: Mutex::new(HashMap::new()),
        }
    }

    /// Number of objects in the last successful load.
    pub fn known(&self) -> usize {
        self.previous.lock().len()
    }
}

impl<O, S> Refreshable<O> for SnapshotRefresher<O, S>
where
    O: PersistentObject + PartialEq,
    S: SnapshotSource<O>,
{
    #[instrument(skip_all)]
    fn refresh(&self, publisher: &mut Publisher<O>) -> Result<RefreshResults> {
        let mut previous = self.previous.lock();
        let loaded = self.source.load()?;
        debug!("Loaded {} objects", loaded.len());

        let mut current = HashMap::with_capacity(loaded.len());
        for object in loaded {
            let id = object.id().clone();
            match previous.remove(&id) {
                None => publisher.created(Arc::clone(&object)),
                Some(old) if *old != *object => publisher.changed(Arc::clone(&object)),
                Some(_) => {}
            }
            current.insert(id, object);
        }

        let mut vanished: Vec<O::Id> = previous.drain().map(|(id, _)| id).collect();
        vanished.sort();
        for id in vanished {
            publisher.deleted(id);
        }

        *previous = current;
        Ok(publisher.results())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::testing::Bam;
    use crate::error::Error;
    use crate::refresh::DataRefresher;
    use crate::source::MemoryStore;
    use assert_matches::assert_matches;

    #[test]
    fn test_diffs_successive_loads() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Bam::new(1, "one"));
        store.insert(Bam::new(2, "two"));
        let refresher =
            DataRefresher::<Bam>::new("bams", SnapshotRefresher::new(Arc::clone(&store)));

        let first = refresher.refresh().unwrap();
        assert_eq!((first.created, first.changed, first.deleted), (2, 0, 0));

        let unchanged = refresher.refresh().unwrap();
        assert!(unchanged.is_empty());

        store.insert(Bam::new(2, "deux"));
        store.insert(Bam::new(3, "three"));
        store.remove(&1);
        let second = refresher.refresh().unwrap();
        assert_eq!((second.created, second.changed, second.deleted), (1, 1, 1));
        assert_eq!(second.found, 3);
    }

    #[test]
    fn test_failed_load_keeps_previous_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Bam::new(1, "one"));
        let snapshots = SnapshotRefresher::<Bam, _>::new(Arc::clone(&store));
        let refresher = DataRefresher::<Bam>::noop();
        let mut publisher = refresher.publisher();

        snapshots.refresh(&mut publisher).unwrap();
        store.set_available(false);
        assert_matches!(snapshots.refresh(&mut publisher), Err(Error::Source(_)));
        assert_eq!(snapshots.known(), 1);
    }
}
