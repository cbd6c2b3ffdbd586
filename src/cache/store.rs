//! Persistent Object Cache
//!
//! Id-keyed read-through cache whose contents are driven by a
//! [`DataRefresher`]. Secondary sorts and indices can be attached at any time;
//! they are seeded from the current contents and then follow the same
//! refresher.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────── PersistentObjectCache ─────────────────────┐
//! scheduler ───▶  │ DataRefresher ──▶ Topic ─┬─▶ CacheListener ──▶ entries (DashMap) │
//!   (tick)        │                          ├─▶ Sorter "by-name"                    │
//!                 │                          └─▶ Indexer "by-fk"                     │
//! put/remove ───▶ │ writes lock ──▶ entries + every sorter + every indexer           │
//!                 └──────────────────────────────────────────────────────────────────┘
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::config::CacheSettings;
use super::scheduler::Scheduler;
use super::seeder::{SeedHandle, Seeder};
use super::stats::{CacheStats, StatsCounter};
use crate::domain::{PersistentObject, PersistentObjectLookup, RefreshEvent, RefreshResults};
use crate::error::{Error, Result};
use crate::index::{Indexer, SecondaryIndex, SortKey, Sorter};
use crate::lifecycle::WithShutdown;
use crate::refresh::{DataRefresher, ListenerId, RefreshListener};

type Entries<O> = DashMap<<O as PersistentObject>::Id, Arc<O>>;

/// Applies refresh events to the primary map.
struct CacheListener<O: PersistentObject> {
    cache: String,
    entries: Arc<Entries<O>>,
}

impl<O: PersistentObject> RefreshListener<O> for CacheListener<O> {
    fn on_event(&self, event: &RefreshEvent<O>) -> Result<()> {
        match event {
            RefreshEvent::Created { object, .. } | RefreshEvent::Changed { object, .. } => {
                self.entries.insert(object.id().clone(), Arc::clone(object));
            }
            RefreshEvent::Deleted { id, .. } => {
                self.entries.remove(id);
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("cache {}", self.cache)
    }
}

/// A sorter or indexer as held by the cache: once type-erased for
/// maintenance, once as `Any` for typed access.
struct Registered<O: PersistentObject> {
    structure: Arc<dyn SecondaryIndex<O>>,
    typed: Arc<dyn Any + Send + Sync>,
}

type Registry<O> = RwLock<HashMap<String, Registered<O>>>;

/// Refreshable in-memory cache of persistent objects.
pub struct PersistentObjectCache<O: PersistentObject> {
    name: String,
    refresher: Arc<DataRefresher<O>>,
    entries: Arc<Entries<O>>,
    stats: Option<StatsCounter>,
    sorters: Registry<O>,
    indexers: Registry<O>,
    writes: Mutex<()>,
    listener: Mutex<Option<ListenerId>>,
    scheduler: Mutex<Option<Scheduler>>,
    seeder: Seeder,
    reserved_sort: Option<&'static str>,
    shut_down: AtomicBool,
}

impl<O: PersistentObject> PersistentObjectCache<O> {
    /// Create a cache over `refresher` configured by `settings`.
    ///
    /// With `start_with_refresh` the cache is loaded before this returns and a
    /// failing load is returned as the error; the periodic refresh then first
    /// runs one interval later. Otherwise the periodic refresh starts right
    /// away in the background.
    pub fn new(refresher: Arc<DataRefresher<O>>, settings: CacheSettings) -> Result<Self> {
        let cache = Self::open(refresher, &settings, None)?;
        cache.begin_refreshing(&settings)?;
        Ok(cache)
    }

    /// Create a cache that is only ever filled through [`put`](Self::put).
    pub fn standalone(name: impl Into<String>) -> Result<Self> {
        let settings = CacheSettings::default().with_name(name);
        Self::open(Arc::new(DataRefresher::noop()), &settings, None)
    }

    /// Attach to `refresher` without refreshing anything yet.
    pub(crate) fn open(
        refresher: Arc<DataRefresher<O>>,
        settings: &CacheSettings,
        reserved_sort: Option<&'static str>,
    ) -> Result<Self> {
        let name = settings.name.clone();
        let seeder = Seeder::start(&name)?;
        let entries = Arc::new(DashMap::new());
        let listener = refresher.add_listener(Arc::new(CacheListener {
            cache: name.clone(),
            entries: Arc::clone(&entries),
        }))?;

        Ok(Self {
            seeder,
            name,
            refresher,
            entries,
            stats: settings.record_stats.then(StatsCounter::default),
            sorters: RwLock::new(HashMap::new()),
            indexers: RwLock::new(HashMap::new()),
            writes: Mutex::new(()),
            listener: Mutex::new(Some(listener)),
            scheduler: Mutex::new(None),
            reserved_sort,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Run the initial load and start the refresh schedule, as configured.
    pub(crate) fn begin_refreshing(&self, settings: &CacheSettings) -> Result<()> {
        let interval = settings.refresh_interval();
        let initial_delay = if settings.start_with_refresh {
            info!(cache = %self.name, "Loading initial data");
            let results = self.refresher.refresh_and_wait(None)?;
            info!(cache = %self.name, loaded = results.loaded(), "Initial load complete");
            interval.unwrap_or_default()
        } else {
            Duration::ZERO
        };

        let Some(interval) = interval else {
            debug!(cache = %self.name, "No refresh interval, refreshing on demand only");
            return Ok(());
        };
        let refresher = Arc::clone(&self.refresher);
        let cache_name = self.name.clone();
        let scheduler = Scheduler::start(&self.name, initial_delay, interval, move || {
            refresh_tick(&cache_name, &refresher)
        })?;
        *self.scheduler.lock() = Some(scheduler);
        info!(cache = %self.name, ?interval, "Scheduled refresh");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The refresher feeding this cache.
    pub fn refresher(&self) -> &Arc<DataRefresher<O>> {
        &self.refresher
    }

    // =========================================================================
    // Primary Map
    // =========================================================================

    /// Object stored under `id`.
    pub fn get(&self, id: &O::Id) -> Option<Arc<O>> {
        let found = self.entries.get(id).map(|entry| Arc::clone(entry.value()));
        if let Some(stats) = &self.stats {
            if found.is_some() {
                stats.record_hit();
            } else {
                stats.record_miss();
            }
        }
        found
    }

    /// Look up several ids at once; the result is parallel to `ids`.
    pub fn lookup(&self, ids: &[O::Id]) -> Vec<Option<Arc<O>>> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    pub fn contains(&self, id: &O::Id) -> bool {
        self.entries.contains_key(id)
    }

    /// Snapshot of all objects, ordered by id.
    pub fn values(&self) -> Vec<Arc<O>> {
        let mut values: Vec<Arc<O>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        values.sort_by(|a, b| a.id().cmp(b.id()));
        values
    }

    /// Snapshot of all ids, in ascending order.
    pub fn ids(&self) -> Vec<O::Id> {
        let mut ids: Vec<O::Id> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Snapshot of the contents as a map.
    pub fn as_map(&self) -> HashMap<O::Id, Arc<O>> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hit/miss counters; all zero unless stats were enabled.
    pub fn stats(&self) -> CacheStats {
        self.stats
            .as_ref()
            .map(StatsCounter::snapshot)
            .unwrap_or_default()
    }

    pub fn is_recording_stats(&self) -> bool {
        self.stats.is_some()
    }

    /// Store `object` directly, bypassing the refresher. The cache and every
    /// attached sort and index are updated together.
    pub fn put(&self, object: impl Into<Arc<O>>) {
        let object = object.into();
        let _writes = self.writes.lock();
        self.entries.insert(object.id().clone(), Arc::clone(&object));
        for registered in self.sorters.read().values() {
            registered.structure.put(Arc::clone(&object));
        }
        for registered in self.indexers.read().values() {
            registered.structure.put(Arc::clone(&object));
        }
    }

    /// Run `f` on the cached object under `id` while direct writes are held
    /// off, so the object cannot be removed through [`remove`](Self::remove)
    /// meanwhile. Does not count towards the stats.
    pub(crate) fn with_cached<R>(&self, id: &O::Id, f: impl FnOnce(Arc<O>) -> R) -> Option<R> {
        let _writes = self.writes.lock();
        let cached = self.entries.get(id).map(|entry| Arc::clone(entry.value()))?;
        Some(f(cached))
    }

    /// Remove `id` directly from the cache and every attached sort and index.
    pub fn remove(&self, id: &O::Id) -> Option<Arc<O>> {
        let _writes = self.writes.lock();
        let removed = self.entries.remove(id).map(|(_, object)| object);
        for registered in self.sorters.read().values() {
            registered.structure.remove(id);
        }
        for registered in self.indexers.read().values() {
            registered.structure.remove(id);
        }
        removed
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Trigger a refresh now. Returns before the cache has applied it.
    pub fn refresh(&self) -> Result<RefreshResults> {
        self.refresher.refresh()
    }

    /// Trigger a refresh and wait until the cache and all its sorts and
    /// indices have applied it.
    pub fn refresh_and_wait(&self, timeout: Option<Duration>) -> Result<RefreshResults> {
        self.refresher.refresh_and_wait(timeout)
    }

    // =========================================================================
    // Sorts
    // =========================================================================

    /// Attach a sort named `id`, replacing any sort registered under that id.
    ///
    /// The sort is filled from the current contents in the background; the
    /// returned handle reports how many objects were processed.
    pub fn add_sort<S, F>(&self, id: &str, factory: F) -> Result<SeedHandle>
    where
        S: Ord + Clone + Send + Sync + 'static,
        F: Fn(&O, bool) -> SortKey<S> + Send + Sync + 'static,
    {
        if self.reserved_sort == Some(id) {
            return Err(Error::ReservedSortId(id.to_string()));
        }
        self.install_sort(id, Sorter::new(id, factory)).map(|(_, handle)| handle)
    }

    pub(crate) fn install_sort<S>(
        &self,
        id: &str,
        sorter: Sorter<O, S>,
    ) -> Result<(Arc<Sorter<O, S>>, SeedHandle)>
    where
        S: Ord + Clone + Send + Sync + 'static,
    {
        let sorter = Arc::new(sorter);
        let handle = self.install(
            &self.sorters,
            "sort",
            id,
            Arc::clone(&sorter) as Arc<dyn SecondaryIndex<O>>,
            Arc::clone(&sorter) as Arc<dyn Any + Send + Sync>,
        )?;
        Ok((sorter, handle))
    }

    /// The sort registered under `id`, typed by its sort value.
    pub fn sorter<S>(&self, id: &str) -> Result<Arc<Sorter<O, S>>>
    where
        S: Ord + Clone + Send + Sync + 'static,
    {
        let sorters = self.sorters.read();
        let registered = sorters.get(id).ok_or_else(|| self.unknown_sort(id))?;
        Arc::clone(&registered.typed)
            .downcast::<Sorter<O, S>>()
            .map_err(|_| Error::StructureTypeMismatch {
                structure: "sort",
                id: id.to_string(),
                cache: self.name.clone(),
            })
    }

    /// Objects of sort `id`, in ascending sort order.
    pub fn sorted_values(&self, id: &str) -> Result<Vec<Arc<O>>> {
        let sorters = self.sorters.read();
        let registered = sorters.get(id).ok_or_else(|| self.unknown_sort(id))?;
        Ok(registered.structure.values())
    }

    /// Ids of sort `id`, in ascending sort order.
    pub fn sorted_ids(&self, id: &str) -> Result<Vec<O::Id>> {
        Ok(self
            .sorted_values(id)?
            .iter()
            .map(|object| object.id().clone())
            .collect())
    }

    /// Detach and drop sort `id`.
    pub fn remove_sort(&self, id: &str) -> Result<()> {
        if self.reserved_sort == Some(id) {
            return Err(Error::ReservedSortId(id.to_string()));
        }
        self.uninstall(&self.sorters, id)
            .ok_or_else(|| self.unknown_sort(id))
    }

    /// Ids of all registered sorts.
    pub fn sort_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sorters.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Indices
    // =========================================================================

    /// Attach an index named `id`, replacing any index registered under that
    /// id. Objects for which `factory` returns `None` are not indexed.
    pub fn add_index<K, F>(&self, id: &str, factory: F) -> Result<SeedHandle>
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
        F: Fn(&O) -> Option<K> + Send + Sync + 'static,
    {
        let indexer = Arc::new(Indexer::new(id, factory).owned_by(&self.name));
        self.install(
            &self.indexers,
            "index",
            id,
            Arc::clone(&indexer) as Arc<dyn SecondaryIndex<O>>,
            indexer as Arc<dyn Any + Send + Sync>,
        )
    }

    /// The index registered under `id`, typed by its key.
    pub fn indexer<K>(&self, id: &str) -> Result<Arc<Indexer<O, K>>>
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    {
        let indexers = self.indexers.read();
        let registered = indexers.get(id).ok_or_else(|| self.unknown_index(id))?;
        Arc::clone(&registered.typed)
            .downcast::<Indexer<O, K>>()
            .map_err(|_| Error::StructureTypeMismatch {
                structure: "index",
                id: id.to_string(),
                cache: self.name.clone(),
            })
    }

    /// Objects indexed under `key` in index `id`, ordered by object id.
    pub fn indexed<K>(&self, id: &str, key: &K) -> Result<Vec<Arc<O>>>
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    {
        Ok(self.indexer::<K>(id)?.get(key))
    }

    /// The single object indexed under `key` in index `id`.
    pub fn indexed_single<K>(&self, id: &str, key: &K) -> Result<Option<Arc<O>>>
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    {
        self.indexer::<K>(id)?.get_single(key)
    }

    /// Detach and drop index `id`.
    pub fn remove_index(&self, id: &str) -> Result<()> {
        self.uninstall(&self.indexers, id)
            .ok_or_else(|| self.unknown_index(id))
    }

    /// Ids of all registered indices.
    pub fn index_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.indexers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Registration
    // =========================================================================

    fn install(
        &self,
        registry: &Registry<O>,
        kind: &'static str,
        id: &str,
        structure: Arc<dyn SecondaryIndex<O>>,
        typed: Arc<dyn Any + Send + Sync>,
    ) -> Result<SeedHandle> {
        self.ensure_running()?;
        {
            let mut registry = registry.write();
            if let Some(previous) = registry.remove(id) {
                info!(cache = %self.name, "Replacing {} {}", kind, id);
                if let Err(e) = previous.structure.unbind(&self.refresher) {
                    warn!(cache = %self.name, "Problem unbinding {} {}: {}", kind, id, e);
                }
            }
            // Updates from here on take precedence over the seed snapshot.
            structure.begin_seed();
            structure
                .binding()
                .bind(Arc::clone(&structure), &self.refresher)?;
            registry.insert(
                id.to_string(),
                Registered {
                    structure: Arc::clone(&structure),
                    typed,
                },
            );
        }
        info!(cache = %self.name, "Added {} {}", kind, id);
        self.schedule_seed(structure)
    }

    fn uninstall(&self, registry: &Registry<O>, id: &str) -> Option<()> {
        let removed = registry.write().remove(id)?;
        if let Err(e) = removed.structure.unbind(&self.refresher) {
            warn!(cache = %self.name, "Problem unbinding {}: {}", id, e);
        }
        info!(cache = %self.name, "Removed {}", removed.structure.label());
        Some(())
    }

    fn schedule_seed(&self, structure: Arc<dyn SecondaryIndex<O>>) -> Result<SeedHandle> {
        let cache = self.name.clone();
        let entries = Arc::clone(&self.entries);
        let refresher = Arc::clone(&self.refresher);
        let label = structure.label();

        self.seeder.submit(label, move || {
            seed_structure(&cache, &refresher, &entries, structure.as_ref())
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::ShutDown(format!("cache {}", self.name)))
        } else {
            Ok(())
        }
    }

    fn unknown_sort(&self, id: &str) -> Error {
        Error::UnknownSort {
            id: id.to_string(),
            cache: self.name.clone(),
        }
    }

    fn unknown_index(&self, id: &str) -> Error {
        Error::UnknownIndex {
            id: id.to_string(),
            cache: self.name.clone(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the refresh schedule, the seeder and the refresher, and drop the
    /// contents. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(cache = %self.name, "Shutting down cache");

        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        for (id, registered) in self
            .sorters
            .write()
            .drain()
            .chain(self.indexers.write().drain())
        {
            if let Err(e) = registered.structure.unbind(&self.refresher) {
                warn!(cache = %self.name, "Problem unbinding {}: {}", id, e);
            }
        }
        if let Some(listener) = self.listener.lock().take() {
            debug!(cache = %self.name, %listener, "Releasing cache listener");
            if let Err(e) = self.refresher.remove_listener(listener) {
                warn!(cache = %self.name, "Problem releasing cache listener: {}", e);
            }
        }
        // Stops every listener worker and wakes a seeder blocked on a barrier.
        self.refresher.shutdown();
        self.seeder.stop();
        self.entries.clear();
        info!(cache = %self.name, "Cache shut down");
    }
}

#[instrument(skip(refresher))]
fn refresh_tick<O: PersistentObject>(cache: &str, refresher: &DataRefresher<O>) {
    match refresher.refresh() {
        Ok(results) => debug!(found = results.found, "Cache refreshed"),
        Err(e) => error!("Problem with cache refresh: {}", e),
    }
}

/// Fill `structure` from a snapshot of `entries` taken after all listeners
/// caught up, so nothing published before the structure was bound is missed.
#[instrument(skip(refresher, entries, structure), fields(structure = %structure.label()))]
fn seed_structure<O: PersistentObject>(
    cache: &str,
    refresher: &DataRefresher<O>,
    entries: &Entries<O>,
    structure: &dyn SecondaryIndex<O>,
) -> Result<usize> {
    if let Err(e) = refresher.wait_for_listeners(None) {
        match e {
            Error::ShutDown(_) => return Err(e),
            other => warn!("Seeding without a quiescent snapshot: {}", other),
        }
    }
    let snapshot: Vec<Arc<O>> = entries
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    let processed = structure.seed(&snapshot);
    debug!(cache, processed, held = structure.len(), "Seeded from cache snapshot");
    Ok(processed)
}

impl<O: PersistentObject> PersistentObjectLookup<O> for PersistentObjectCache<O> {
    fn lookup(&self, ids: &[O::Id]) -> Vec<Option<Arc<O>>> {
        PersistentObjectCache::lookup(self, ids)
    }
}

impl<O: PersistentObject> WithShutdown for PersistentObjectCache<O> {
    fn shutdown(&self) {
        PersistentObjectCache::shutdown(self);
    }
}

impl<O: PersistentObject> Drop for PersistentObjectCache<O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
