//! Indexer
//!
//! Hashed secondary index. Keys are not unique; each key maps to the set of
//! objects that currently produce it.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Binding, SecondaryIndex};
use crate::domain::PersistentObject;
use crate::error::{Error, Result};
use crate::refresh::DataRefresher;

type IndexKeyFactory<O, K> = dyn Fn(&O) -> Option<K> + Send + Sync;

struct IndexState<O: PersistentObject, K> {
    buckets: HashMap<K, HashMap<O::Id, Arc<O>>>,
    keys: HashMap<O::Id, K>,
    touched: Option<HashSet<O::Id>>,
}

impl<O: PersistentObject, K: Eq + Hash + Clone> IndexState<O, K> {
    fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            keys: HashMap::new(),
            touched: None,
        }
    }

    fn apply(&mut self, factory: &IndexKeyFactory<O, K>, object: Arc<O>) {
        let id = object.id().clone();
        self.detach(&id);
        if let Some(key) = factory(&object) {
            self.buckets
                .entry(key.clone())
                .or_default()
                .insert(id.clone(), object);
            self.keys.insert(id, key);
        }
    }

    fn detach(&mut self, id: &O::Id) -> Option<Arc<O>> {
        let key = self.keys.remove(id)?;
        let bucket = self.buckets.get_mut(&key)?;
        let removed = bucket.remove(id);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        removed
    }

    fn touch(&mut self, id: &O::Id) {
        if let Some(touched) = self.touched.as_mut() {
            touched.insert(id.clone());
        }
    }
}

/// Concurrent hashed view over persistent objects.
pub struct Indexer<O: PersistentObject, K: Eq + Hash + Clone + Debug + Send + Sync + 'static> {
    name: String,
    owner: String,
    factory: Box<IndexKeyFactory<O, K>>,
    state: RwLock<IndexState<O, K>>,
    binding: Binding,
}

impl<O, K> Indexer<O, K>
where
    O: PersistentObject,
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create an indexer. Objects for which `factory` returns `None` are left
    /// out of the index.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&O) -> Option<K> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            owner: "standalone".to_string(),
            factory: Box::new(factory),
            state: RwLock::new(IndexState::new()),
            binding: Binding::default(),
        }
    }

    /// Name of the cache this indexer belongs to, for error reporting.
    pub(crate) fn owned_by(mut self, cache: &str) -> Self {
        self.owner = cache.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index `object` under the key its factory produces, moving it out of any
    /// previous bucket.
    pub fn put(&self, object: Arc<O>) {
        let mut state = self.state.write();
        state.touch(object.id());
        state.apply(self.factory.as_ref(), object);
    }

    /// Remove `id` from the index, returning the object it held.
    pub fn remove(&self, id: &O::Id) -> Option<Arc<O>> {
        let mut state = self.state.write();
        state.touch(id);
        state.detach(id)
    }

    /// Objects indexed under `key`, ordered by id. Empty if there are none.
    pub fn get(&self, key: &K) -> Vec<Arc<O>> {
        let state = self.state.read();
        let mut objects: Vec<Arc<O>> = state
            .buckets
            .get(key)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default();
        objects.sort_by(|a, b| a.id().cmp(b.id()));
        objects
    }

    /// The one object indexed under `key`.
    ///
    /// Fails with [`Error::MultipleMatches`] when the key is shared.
    pub fn get_single(&self, key: &K) -> Result<Option<Arc<O>>> {
        let state = self.state.read();
        match state.buckets.get(key) {
            None => Ok(None),
            Some(bucket) if bucket.len() == 1 => Ok(bucket.values().next().cloned()),
            Some(_) => Err(Error::MultipleMatches {
                index: self.name.clone(),
                key: format!("{:?}", key),
                cache: self.owner.clone(),
            }),
        }
    }

    /// Key `id` is currently indexed under.
    pub fn key_of(&self, id: &O::Id) -> Option<K> {
        self.state.read().keys.get(id).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.state.read().buckets.contains_key(key)
    }

    /// Snapshot of the distinct keys.
    pub fn keys(&self) -> Vec<K> {
        self.state.read().buckets.keys().cloned().collect()
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.state.read().buckets.len()
    }

    /// Number of indexed objects.
    pub fn len(&self) -> usize {
        self.state.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep this indexer up to date with the events of `refresher`.
    pub fn bind(self: &Arc<Self>, refresher: &DataRefresher<O>) -> Result<()> {
        let target: Arc<dyn SecondaryIndex<O>> = Arc::clone(self) as Arc<dyn SecondaryIndex<O>>;
        self.binding.bind(target, refresher)
    }

    /// Stop listening to `refresher`.
    pub fn unbind(&self, refresher: &DataRefresher<O>) -> Result<()> {
        self.binding.unbind(self.label(), refresher)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }
}

impl<O, K> SecondaryIndex<O> for Indexer<O, K>
where
    O: PersistentObject,
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn label(&self) -> String {
        format!("indexer {}", self.name)
    }

    fn put(&self, object: Arc<O>) {
        Indexer::put(self, object);
    }

    fn remove(&self, id: &O::Id) {
        Indexer::remove(self, id);
    }

    fn begin_seed(&self) {
        self.state.write().touched = Some(HashSet::new());
    }

    fn seed(&self, snapshot: &[Arc<O>]) -> usize {
        let mut state = self.state.write();
        let touched = state.touched.take().unwrap_or_default();
        for object in snapshot {
            if !touched.contains(object.id()) {
                state.apply(self.factory.as_ref(), Arc::clone(object));
            }
        }
        snapshot.len()
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn unbind(&self, refresher: &DataRefresher<O>) -> Result<()> {
        Indexer::unbind(self, refresher)
    }

    fn values(&self) -> Vec<Arc<O>> {
        let state = self.state.read();
        let mut objects: Vec<Arc<O>> = state
            .buckets
            .values()
            .flat_map(|bucket| bucket.values().cloned())
            .collect();
        objects.sort_by(|a, b| a.id().cmp(b.id()));
        objects
    }

    fn len(&self) -> usize {
        Indexer::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::testing::Bam;
    use crate::domain::RefreshEvent;
    use assert_matches::assert_matches;

    fn by_name() -> Indexer<Bam, String> {
        Indexer::new("by-name", |b: &Bam| Some(b.name.clone()))
    }

    fn ids(objects: &[Arc<Bam>]) -> Vec<i64> {
        objects.iter().map(|b| b.id).collect()
    }

    #[test]
    fn test_non_unique_keys() {
        let index = by_name();
        for (id, name) in [(1, "foo"), (2, "foo"), (3, "foo"), (4, "bar"), (5, "bar")] {
            index.put(Arc::new(Bam::new(id, name)));
        }

        assert_eq!(ids(&index.get(&"foo".to_string())), vec![1, 2, 3]);
        assert_eq!(ids(&index.get(&"bar".to_string())), vec![4, 5]);
        assert!(index.get(&"baz".to_string()).is_empty());
        assert_eq!(index.len(), 5);
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn test_rekey_moves_object() {
        let index = by_name();
        index.put(Arc::new(Bam::new(1, "foo")));
        index.put(Arc::new(Bam::new(1, "bar")));

        assert!(!index.contains_key(&"foo".to_string()));
        assert_eq!(index.key_of(&1).as_deref(), Some("bar"));
        assert_eq!(index.keys(), vec!["bar".to_string()]);
    }

    #[test]
    fn test_none_key_excludes() {
        let index = Indexer::new("fk", |b: &Bam| (b.name != "skip").then_some(b.one_to_one_fk));
        index.put(Arc::new(Bam::new(1, "keep")));
        assert_eq!(index.get_single(&10).unwrap().map(|b| b.id), Some(1));

        index.put(Arc::new(Bam::new(1, "skip")));
        assert!(index.is_empty());
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn test_get_single_multiple_matches() {
        let index = by_name();
        index.put(Arc::new(Bam::new(1, "foo")));
        index.put(Arc::new(Bam::new(2, "foo")));

        assert_matches!(
            index.get_single(&"foo".to_string()),
            Err(Error::MultipleMatches { .. })
        );
        assert_matches!(index.get_single(&"bar".to_string()), Ok(None));
    }

    #[test]
    fn test_remove_drops_empty_bucket() {
        let index = by_name();
        index.put(Arc::new(Bam::new(1, "foo")));
        index.put(Arc::new(Bam::new(2, "foo")));

        assert_eq!(index.remove(&1).map(|b| b.id), Some(1));
        assert_eq!(ids(&index.get(&"foo".to_string())), vec![2]);
        index.remove(&2);
        assert!(!index.contains_key(&"foo".to_string()));
        assert!(index.remove(&2).is_none());
    }

    #[test]
    fn test_follows_refresher_events() {
        let refresher = DataRefresher::<Bam>::noop();
        let index = Arc::new(by_name());
        index.bind(&refresher).unwrap();
        assert_matches!(index.bind(&refresher), Err(Error::AlreadyBound(_)));

        refresher.publish(RefreshEvent::created(Bam::new(1, "foo")));
        refresher.publish(RefreshEvent::changed(Bam::new(1, "bar")));
        refresher.publish(RefreshEvent::created(Bam::new(2, "bar")));
        refresher.publish(RefreshEvent::deleted(2));
        refresher.wait_for_listeners(None).unwrap();

        assert_eq!(ids(&index.get(&"bar".to_string())), vec![1]);
        assert!(index.get(&"foo".to_string()).is_empty());

        index.unbind(&refresher).unwrap();
        assert_matches!(index.unbind(&refresher), Err(Error::NotBound(_)));
    }
}
