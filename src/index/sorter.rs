//! Sorter
//!
//! Ordered secondary index. Positions come from a sort key factory that is
//! consulted on every put; the factory may also veto an object or keep its
//! current position.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Binding, SecondaryIndex, SortKey};
use crate::domain::PersistentObject;
use crate::error::Result;
use crate::refresh::DataRefresher;

type KeyFactory<O, S> = dyn Fn(&O, bool) -> SortKey<S> + Send + Sync;

struct SortState<O: PersistentObject, S> {
    // (sort value, id) so equal sort values never collide
    ordered: BTreeMap<(S, O::Id), Arc<O>>,
    positions: HashMap<O::Id, S>,
    touched: Option<HashSet<O::Id>>,
}

impl<O: PersistentObject, S: Ord + Clone> SortState<O, S> {
    fn new() -> Self {
        Self {
            ordered: BTreeMap::new(),
            positions: HashMap::new(),
            touched: None,
        }
    }

    fn insert(&mut self, value: S, object: Arc<O>) {
        let id = object.id().clone();
        self.detach(&id);
        self.positions.insert(id.clone(), value.clone());
        self.ordered.insert((value, id), object);
    }

    fn detach(&mut self, id: &O::Id) -> Option<Arc<O>> {
        let value = self.positions.remove(id)?;
        self.ordered.remove(&(value, id.clone()))
    }

    fn touch(&mut self, id: &O::Id) {
        if let Some(touched) = self.touched.as_mut() {
            touched.insert(id.clone());
        }
    }
}

/// Concurrent sorted view over persistent objects.
///
/// ```ignore
/// let by_name = Sorter::by("by-name", |bam: &Bam| bam.name.clone());
/// by_name.put(Arc::new(bam));
/// let ordered = by_name.values();
/// ```
pub struct Sorter<O: PersistentObject, S: Ord + Clone + Send + Sync + 'static> {
    name: String,
    factory: Box<KeyFactory<O, S>>,
    state: RwLock<SortState<O, S>>,
    binding: Binding,
}

impl<O, S> Sorter<O, S>
where
    O: PersistentObject,
    S: Ord + Clone + Send + Sync + 'static,
{
    /// Create a sorter. The factory receives the object and whether its id is
    /// absent from the sorter.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&O, bool) -> SortKey<S> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            state: RwLock::new(SortState::new()),
            binding: Binding::default(),
        }
    }

    /// Create a sorter that places every object at `key(object)`.
    pub fn by<F>(name: impl Into<String>, key: F) -> Self
    where
        F: Fn(&O) -> S + Send + Sync + 'static,
    {
        Self::new(name, move |object: &O, _is_new: bool| SortKey::Sort(key(object)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add or move `object` according to the key factory.
    pub fn put(&self, object: Arc<O>) {
        let mut state = self.state.write();
        state.touch(object.id());
        self.apply(&mut state, object);
    }

    /// Place `object` at `value`, bypassing the key factory.
    pub fn put_at(&self, object: Arc<O>, value: S) {
        let mut state = self.state.write();
        state.touch(object.id());
        state.insert(value, object);
    }

    /// Remove the entry for `id`, returning the object it held.
    pub fn remove(&self, id: &O::Id) -> Option<Arc<O>> {
        let mut state = self.state.write();
        state.touch(id);
        state.detach(id)
    }

    pub fn get(&self, id: &O::Id) -> Option<Arc<O>> {
        let state = self.state.read();
        let value = state.positions.get(id)?;
        state.ordered.get(&(value.clone(), id.clone())).cloned()
    }

    /// Current sort value of `id`.
    pub fn sort_value(&self, id: &O::Id) -> Option<S> {
        self.state.read().positions.get(id).cloned()
    }

    pub fn contains(&self, id: &O::Id) -> bool {
        self.state.read().positions.contains_key(id)
    }

    /// Snapshot of the objects, in ascending sort order.
    pub fn values(&self) -> Vec<Arc<O>> {
        self.state.read().ordered.values().cloned().collect()
    }

    /// Snapshot of the ids, in ascending sort order.
    pub fn ids(&self) -> Vec<O::Id> {
        self.state
            .read()
            .ordered
            .keys()
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// First object in sort order.
    pub fn first(&self) -> Option<Arc<O>> {
        self.state
            .read()
            .ordered
            .first_key_value()
            .map(|(_, object)| Arc::clone(object))
    }

    pub fn len(&self) -> usize {
        self.state.read().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep this sorter up to date with the events of `refresher`.
    pub fn bind(self: &Arc<Self>, refresher: &DataRefresher<O>) -> Result<()> {
        let target: Arc<dyn SecondaryIndex<O>> = Arc::clone(self) as Arc<dyn SecondaryIndex<O>>;
        self.binding.bind(target, refresher)
    }

    /// Stop listening to `refresher`. The sorter keeps its contents and may be
    /// bound again.
    pub fn unbind(&self, refresher: &DataRefresher<O>) -> Result<()> {
        self.binding.unbind(self.label(), refresher)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn apply(&self, state: &mut SortState<O, S>, object: Arc<O>) {
        let id = object.id().clone();
        let is_new = !state.positions.contains_key(&id);
        match (self.factory)(&object, is_new) {
            SortKey::Sort(value) => state.insert(value, object),
            SortKey::Delete => {
                state.detach(&id);
            }
            SortKey::Ignore => {
                // Same position, latest object.
                if let Some(value) = state.positions.get(&id).cloned() {
                    state.ordered.insert((value, id), object);
                }
            }
        }
    }
}

impl<O, S> SecondaryIndex<O> for Sorter<O, S>
where
    O: PersistentObject,
    S: Ord + Clone + Send + Sync + 'static,
{
    fn label(&self) -> String {
        format!("sorter {}", self.name)
    }

    fn put(&self, object: Arc<O>) {
        Sorter::put(self, object);
    }

    fn remove(&self, id: &O::Id) {
        Sorter::remove(self, id);
    }

    fn begin_seed(&self) {
        self.state.write().touched = Some(HashSet::new());
    }

    fn seed(&self, snapshot: &[Arc<O>]) -> usize {
        let mut state = self.state.write();
        let touched = state.touched.take().unwrap_or_default();
        for object in snapshot {
            if !touched.contains(object.id()) {
                self.apply(&mut state, Arc::clone(object));
            }
        }
        snapshot.len()
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn unbind(&self, refresher: &DataRefresher<O>) -> Result<()> {
        Sorter::unbind(self, refresher)
    }

    fn values(&self) -> Vec<Arc<O>> {
        Sorter::values(self)
    }

    fn len(&self) -> usize {
        Sorter::len(self)
    }
}
