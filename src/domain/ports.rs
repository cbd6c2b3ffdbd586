//! Domain Ports
//!
//! Trait abstractions for the objects that are cached and for the collaborators
//! that can look them up in a backing store.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// An object that is backed by data in a persistent store and that can be kept
/// in a [`PersistentObjectCache`](crate::cache::PersistentObjectCache).
///
/// The id is the only attribute the cache relies on. It has to be stable for the
/// lifetime of the object in the backing store.
pub trait PersistentObject: Send + Sync + 'static {
    /// Identity type of the object
    type Id: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static;

    /// The persistent object's id
    fn id(&self) -> &Self::Id;
}

/// Abstracts lookup of persistent objects by id.
pub trait PersistentObjectLookup<O: PersistentObject> {
    /// Look up one or more objects by their ids.
    ///
    /// The result is parallel to `ids`: slots for which no object was found are
    /// `None`, so looking up `[1, 2, 3]` when only 1 and 3 exist yields
    /// `[Some(1), None, Some(3)]`.
    fn lookup(&self, ids: &[O::Id]) -> Vec<Option<Arc<O>>>;
}
