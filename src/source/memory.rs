//! In-Memory Backing Store
//!
//! A mutable object store that stands in for a database: it can be listed in
//! full, looked up by id, and switched offline to simulate outages.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::snapshot::SnapshotSource;
use crate::domain::{PersistentObject, PersistentObjectLookup};
use crate::error::{Error, Result};

/// In-memory store keyed by object id.
pub struct MemoryStore<O: PersistentObject> {
    objects: RwLock<BTreeMap<O::Id, Arc<O>>>,
    available: AtomicBool,
}

impl<O: PersistentObject> Default for MemoryStore<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: PersistentObject> MemoryStore<O> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Insert or replace an object; returns the replaced version.
    pub fn insert(&self, object: impl Into<Arc<O>>) -> Option<Arc<O>> {
        let object = object.into();
        self.objects.write().insert(object.id().clone(), object)
    }

    pub fn remove(&self, id: &O::Id) -> Option<Arc<O>> {
        self.objects.write().remove(id)
    }

    pub fn get(&self, id: &O::Id) -> Option<Arc<O>> {
        self.objects.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn clear(&self) {
        self.objects.write().clear();
    }

    /// Take the store offline (`false`) or back online. Loads fail while
    /// offline; the contents are kept.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

impl<O: PersistentObject> SnapshotSource<O> for MemoryStore<O> {
    fn load(&self) -> Result<Vec<Arc<O>>> {
        if !self.is_available() {
            return Err(Error::source(io::Error::new(
                io::ErrorKind::NotConnected,
                "store is offline",
            )));
        }
        Ok(self.objects.read().values().cloned().collect())
    }
}

impl<O: PersistentObject> PersistentObjectLookup<O> for MemoryStore<O> {
    fn lookup(&self, ids: &[O::Id]) -> Vec<Option<Arc<O>>> {
        let objects = self.objects.read();
        ids.iter().map(|id| objects.get(id).cloned()).collect()
    }
}
