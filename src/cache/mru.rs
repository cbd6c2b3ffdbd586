//! Most-Recently-Used Cache
//!
//! A [`PersistentObjectCache`] that always carries one extra sort, keyed by
//! the time an object was last promoted. What counts as a promotion is decided
//! by a [`PromotionStrategy`]; [`MruCache::touch`] promotes regardless of it.

use std::ops::Deref;
use std::sync::Arc;

use crate::clock::Clock;
use crate::domain::PersistentObject;
use crate::index::{DescendingLong, SortKey, Sorter, TieBreaker};
use crate::lifecycle::WithShutdown;

use super::store::PersistentObjectCache;

/// Id of the built-in recency sort. It cannot be replaced or removed.
pub const MRU_SORT_ID: &str = "mru";

/// Verdict of a [`PromotionStrategy`] for one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// Move the object to the front
    Promote,
    /// Keep the current position
    Ignore,
    /// Drop the object from the recency order
    Delete,
}

/// Decides whether an update moves an object to the front.
pub trait PromotionStrategy<O: PersistentObject>: Send + Sync {
    /// `is_new` is true when the object is not in the recency order yet.
    fn promote(&self, object: &O, is_new: bool) -> Promotion;
}

impl<O, F> PromotionStrategy<O> for F
where
    O: PersistentObject,
    F: Fn(&O, bool) -> Promotion + Send + Sync,
{
    fn promote(&self, object: &O, is_new: bool) -> Promotion {
        self(object, is_new)
    }
}

/// Promote on first sight only. Updates keep their position.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromoteWhenNewOnly;

impl<O: PersistentObject> PromotionStrategy<O> for PromoteWhenNewOnly {
    fn promote(&self, _object: &O, is_new: bool) -> Promotion {
        if is_new {
            Promotion::Promote
        } else {
            Promotion::Ignore
        }
    }
}

/// Promote on every creation and update.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromoteWhenNewOrUpdated;

impl<O: PersistentObject> PromotionStrategy<O> for PromoteWhenNewOrUpdated {
    fn promote(&self, _object: &O, _is_new: bool) -> Promotion {
        Promotion::Promote
    }
}

/// Never promote from puts or refreshes. Objects enter the recency order only
/// through [`MruCache::touch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PromoteNever;

impl<O: PersistentObject> PromotionStrategy<O> for PromoteNever {
    fn promote(&self, _object: &O, _is_new: bool) -> Promotion {
        Promotion::Ignore
    }
}

pub(crate) type MruSorter<O> = Sorter<O, DescendingLong>;

/// Build the recency sorter for `strategy`, stamping promotions with `clock`.
pub(crate) fn mru_sorter<O: PersistentObject>(
    strategy: Arc<dyn PromotionStrategy<O>>,
    clock: Arc<dyn Clock>,
    ties: Arc<TieBreaker>,
) -> MruSorter<O> {
    Sorter::new(MRU_SORT_ID, move |object: &O, is_new: bool| {
        match strategy.promote(object, is_new) {
            Promotion::Promote => SortKey::Sort(DescendingLong::new(clock.now_millis(), &ties)),
            Promotion::Ignore => SortKey::Ignore,
            Promotion::Delete => SortKey::Delete,
        }
    })
}

/// Cache with a built-in most-recently-used ordering.
///
/// Dereferences to the underlying [`PersistentObjectCache`] for everything
/// else.
pub struct MruCache<O: PersistentObject> {
    cache: PersistentObjectCache<O>,
    mru: Arc<MruSorter<O>>,
    clock: Arc<dyn Clock>,
    ties: Arc<TieBreaker>,
}

impl<O: PersistentObject> MruCache<O> {
    pub(crate) fn new(
        cache: PersistentObjectCache<O>,
        mru: Arc<MruSorter<O>>,
        clock: Arc<dyn Clock>,
        ties: Arc<TieBreaker>,
    ) -> Self {
        Self {
            cache,
            mru,
            clock,
            ties,
        }
    }

    /// Mark `object` as used now, moving it to the front whatever the
    /// promotion strategy says. Only objects the cache holds can be touched;
    /// the cached instance is the one listed. Returns false if the cache does
    /// not hold an object with the same id.
    pub fn touch(&self, object: &O) -> bool {
        self.touch_id(object.id())
    }

    /// Mark the cached object with `id` as used now. Returns false if the
    /// cache does not hold it.
    pub fn touch_id(&self, id: &O::Id) -> bool {
        self.cache
            .with_cached(id, |cached| {
                let key = DescendingLong::new(self.clock.now_millis(), &self.ties);
                self.mru.put_at(cached, key);
            })
            .is_some()
    }

    /// Objects, most recently used first.
    pub fn values_by_most_recently_used(&self) -> Vec<Arc<O>> {
        self.mru.values()
    }

    /// Ids, most recently used first.
    pub fn mru_ids(&self) -> Vec<O::Id> {
        self.mru.ids()
    }

    /// The most recently used object.
    pub fn most_recently_used(&self) -> Option<Arc<O>> {
        self.mru.first()
    }

    /// Direct access to the recency sorter.
    pub fn mru_sorter(&self) -> &Arc<Sorter<O, DescendingLong>> {
        &self.mru
    }

    /// The wrapped cache.
    pub fn cache(&self) -> &PersistentObjectCache<O> {
        &self.cache
    }
}

impl<O: PersistentObject> WithShutdown for MruCache<O> {
    fn shutdown(&self) {
        self.cache.shutdown();
    }
}

impl<O: PersistentObject> Deref for MruCache<O> {
    type Target = PersistentObjectCache<O>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}
