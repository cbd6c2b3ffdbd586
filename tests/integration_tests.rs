//! dbsync Integration Tests
//!
//! Tests for the public surface:
//! - Refresh fan-out and the listener barrier
//! - Cache with sorts and indices driven by a refresher
//! - MRU cache promotion
//! - Snapshot sources and shutdown hooks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dbsync::{PersistentObject, RefreshEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Bam {
    id: i64,
    name: String,
    one_to_one_fk: i64,
}

impl Bam {
    fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            one_to_one_fk: id * 10,
        }
    }
}

impl PersistentObject for Bam {
    type Id = i64;

    fn id(&self) -> &i64 {
        &self.id
    }
}

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn names(values: &[Arc<Bam>]) -> Vec<String> {
    values.iter().map(|b| b.name.clone()).collect()
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

// =============================================================================
// Refresh Fan-out and Barrier
// =============================================================================

mod refresh_tests {
    use super::*;
    use dbsync::{DataRefresher, Publisher, RefreshListener, Result};

    fn counting_listener(delay: Duration) -> (Arc<dyn RefreshListener<Bam>>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        let listener: Arc<dyn RefreshListener<Bam>> =
            Arc::new(move |_: &RefreshEvent<Bam>| -> Result<()> {
                thread::sleep(delay);
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        (listener, count)
    }

    #[test]
    fn test_barrier_waits_for_every_listener() {
        let refresher = DataRefresher::from_fn("bams", |publisher: &mut Publisher<Bam>| {
            for id in 0..100 {
                publisher.created(Bam::new(id, "bam"));
            }
            Ok(publisher.results())
        });
        let counts: Vec<Arc<AtomicUsize>> = [0u64, 1, 0]
            .iter()
            .map(|ms| {
                let (listener, count) = counting_listener(Duration::from_micros(ms * 200));
                refresher.add_listener(listener).unwrap();
                count
            })
            .collect();

        let results = refresher.refresh_and_wait(None).unwrap();
        assert_eq!(results.created, 100);
        for count in counts {
            assert_eq!(count.load(Ordering::SeqCst), 100);
        }
    }

    #[test]
    fn test_barrier_without_listeners_returns_immediately() {
        let refresher = DataRefresher::<Bam>::noop();
        let started = Instant::now();
        refresher
            .wait_for_listeners(Some(Duration::from_millis(1)))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(refresher.markers_published(), 0);
        assert_eq!(refresher.listener_count(), 0);

        let (listener, seen) = counting_listener(Duration::ZERO);
        refresher.add_listener(listener).unwrap();
        refresher.wait_for_listeners(WAIT).unwrap();
        assert_eq!(refresher.markers_published(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_listener_does_not_stop_delivery() {
        let refresher = DataRefresher::<Bam>::noop();
        let seen = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&seen);
        let flaky: Arc<dyn RefreshListener<Bam>> =
            Arc::new(move |event: &RefreshEvent<Bam>| -> Result<()> {
                counted.fetch_add(1, Ordering::SeqCst);
                match *event.id() {
                    2 => Err(dbsync::Error::Listener("bad bam".to_string())),
                    3 => panic!("worse bam"),
                    _ => Ok(()),
                }
            });
        refresher.add_listener(flaky).unwrap();

        for id in 1..=5 {
            refresher.publish(RefreshEvent::deleted(id));
        }
        refresher.wait_for_listeners(WAIT).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}

// =============================================================================
// Cache
// =============================================================================

mod cache_tests {
    use super::*;
    use dbsync::{CacheBuilder, DataRefresher, Error, MemoryStore, SnapshotRefresher, SortKey};

    #[test]
    fn test_last_write_wins() {
        let refresher = Arc::new(DataRefresher::<Bam>::noop());
        let cache = CacheBuilder::new(Arc::clone(&refresher)).build().unwrap();

        refresher.publish(RefreshEvent::created(Bam::new(1, "created")));
        refresher.publish(RefreshEvent::changed(Bam::new(1, "changed")));
        refresher.publish(RefreshEvent::created(Bam::new(2, "two")));
        refresher.publish(RefreshEvent::deleted(2));
        refresher.publish(RefreshEvent::changed(Bam::new(1, "changed again")));
        refresher.wait_for_listeners(WAIT).unwrap();

        assert_eq!(cache.get(&1).unwrap().name, "changed again");
        assert!(cache.get(&2).is_none());
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_sorter_follows_refresher() {
        let store = Arc::new(MemoryStore::new());
        for (id, name) in [(1, "Bambading"), (2, "Rengkedeng"), (3, "Doioing"), (4, "Aiaiaiai")] {
            store.insert(Bam::new(id, name));
        }
        let cache = CacheBuilder::new(DataRefresher::<Bam>::new(
            "bams",
            SnapshotRefresher::new(Arc::clone(&store)),
        ))
        .refresh_on_construction(true)
        .build()
        .unwrap();

        let seeded = cache
            .add_sort("name", |b: &Bam, _| SortKey::Sort(b.name.clone()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(seeded, cache.size());

        store.insert(Bam::new(5, "Abababai"));
        store.insert(Bam::new(6, "Eieieiei"));
        cache.refresh_and_wait(WAIT).unwrap();
        assert_eq!(
            names(&cache.sorted_values("name").unwrap()),
            vec!["Abababai", "Aiaiaiai", "Bambading", "Doioing", "Eieieiei", "Rengkedeng"]
        );

        for id in [1, 3, 5] {
            store.remove(&id);
        }
        let results = cache.refresh_and_wait(WAIT).unwrap();
        assert_eq!(results.deleted, 3);
        assert_eq!(
            names(&cache.sorted_values("name").unwrap()),
            vec!["Aiaiaiai", "Eieieiei", "Rengkedeng"]
        );
    }

    #[test]
    fn test_indexers_seed_whole_cache() {
        let store = Arc::new(MemoryStore::new());
        for (id, name) in [(1, "foo"), (2, "foo"), (3, "foo"), (4, "bar"), (5, "bar")] {
            store.insert(Bam::new(id, name));
        }
        let cache = CacheBuilder::new(DataRefresher::<Bam>::new(
            "bams",
            SnapshotRefresher::new(Arc::clone(&store)),
        ))
        .refresh_on_construction(true)
        .build()
        .unwrap();

        let seeded = cache
            .add_index("name", |b: &Bam| Some(b.name.clone()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(seeded, cache.size());
        assert_eq!(cache.indexed("name", &"foo".to_string()).unwrap().len(), 3);
        assert_eq!(cache.indexed("name", &"bar".to_string()).unwrap().len(), 2);

        cache
            .add_index("oneone", |b: &Bam| Some(b.one_to_one_fk))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(cache.indexed_single("oneone", &30i64).unwrap().unwrap().id, 3);
        assert!(cache.indexed_single("oneone", &31i64).unwrap().is_none());

        store.insert(Bam::new(2, "bar"));
        cache.refresh_and_wait(WAIT).unwrap();
        assert_eq!(cache.indexed("name", &"foo".to_string()).unwrap().len(), 2);
        assert_eq!(cache.indexed("name", &"bar".to_string()).unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_structures_are_usage_errors() {
        let cache = CacheBuilder::<Bam>::without_refresher().build().unwrap();
        let err = cache.sorted_values("missing").unwrap_err();
        assert!(err.is_usage_error());
        assert!(matches!(err, Error::UnknownSort { .. }));
        assert!(matches!(
            cache.indexed("missing", &1i64),
            Err(Error::UnknownIndex { .. })
        ));
    }

    #[test]
    fn test_failing_scheduled_refresh_keeps_last_good_state() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Bam::new(1, "one"));
        let cache = CacheBuilder::new(DataRefresher::<Bam>::new(
            "bams",
            SnapshotRefresher::new(Arc::clone(&store)),
        ))
        .refresh_on_construction(true)
        .refresh_every(Duration::from_millis(20))
        .build()
        .unwrap();
        cache
            .add_index("name", |b: &Bam| Some(b.name.clone()))
            .unwrap()
            .wait()
            .unwrap();
        let listeners = cache.refresher().listener_count();

        store.set_available(false);
        store.insert(Bam::new(2, "two"));
        thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.ids(), vec![1]);
        assert_eq!(cache.refresher().listener_count(), listeners);

        store.set_available(true);
        assert!(wait_until(|| cache.get(&2).is_some()));
        assert!(wait_until(|| cache
            .indexed("name", &"two".to_string())
            .map(|found| found.len() == 1)
            .unwrap_or(false)));
    }

    #[test]
    fn test_initial_load_failure_fails_construction() {
        let store = Arc::new(MemoryStore::<Bam>::new());
        store.set_available(false);
        let result = CacheBuilder::new(DataRefresher::<Bam>::new(
            "bams",
            SnapshotRefresher::new(Arc::clone(&store)),
        ))
        .refresh_on_construction(true)
        .build();
        assert!(matches!(result, Err(Error::Source(_))));
    }

    #[test]
    fn test_concurrent_direct_writes_keep_structures_in_step() {
        let cache = Arc::new(CacheBuilder::<Bam>::without_refresher().build().unwrap());
        cache
            .add_sort("id", |b: &Bam, _| SortKey::Sort(b.id))
            .unwrap()
            .wait()
            .unwrap();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for n in 0..50 {
                        let id = w * 50 + n;
                        cache.put(Bam::new(id, "bam"));
                        if id % 5 == 0 {
                            cache.remove(&id);
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(cache.size(), 160);
        assert_eq!(cache.sorted_ids("id").unwrap(), cache.ids());
    }

    #[tokio::test]
    async fn test_refresh_from_async_context() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Bam::new(1, "one"));
        let cache = Arc::new(
            CacheBuilder::new(DataRefresher::<Bam>::new(
                "bams",
                SnapshotRefresher::new(Arc::clone(&store)),
            ))
            .build()
            .unwrap(),
        );

        let refreshing = Arc::clone(&cache);
        let results = tokio::task::spawn_blocking(move || refreshing.refresh_and_wait(WAIT))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.created, 1);
        assert_eq!(cache.size(), 1);
    }
}

// =============================================================================
// MRU Cache
// =============================================================================

mod mru_tests {
    use super::*;
    use dbsync::cache::MRU_SORT_ID;
    use dbsync::{CacheBuilder, Clock, Error, ManualClock, SortKey};

    #[test]
    fn test_touch_moves_to_front() {
        let clock = Arc::new(ManualClock::from_millis(1_000));
        let cache = CacheBuilder::<Bam>::without_refresher()
            .with_mru_sort()
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .build()
            .unwrap();

        for (id, name) in [(1, "first"), (2, "second"), (3, "third")] {
            cache.put(Bam::new(id, name));
            clock.set_millis(1_000 * (id + 1));
        }
        assert_eq!(cache.mru_ids(), vec![3, 2, 1]);

        assert!(cache.touch(&Bam::new(2, "second")));
        assert_eq!(
            names(&cache.values_by_most_recently_used()),
            vec!["second", "third", "first"]
        );
    }

    #[test]
    fn test_promote_new_only_ignores_updates() {
        let clock = Arc::new(ManualClock::from_millis(1_000));
        let cache = CacheBuilder::<Bam>::without_refresher()
            .with_mru_sort()
            .promote_when_new_only()
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .build()
            .unwrap();

        cache.put(Bam::new(1, "first"));
        clock.set_millis(2_000);
        cache.put(Bam::new(2, "second"));
        clock.set_millis(3_000);
        cache.put(Bam::new(1, "first"));

        assert_eq!(cache.mru_ids(), vec![2, 1]);
    }

    #[test]
    fn test_promote_always_moves_updates() {
        let clock = Arc::new(ManualClock::from_millis(1_000));
        let cache = CacheBuilder::<Bam>::without_refresher()
            .with_mru_sort()
            .promote_when_new_or_updated()
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .build()
            .unwrap();

        cache.put(Bam::new(1, "first"));
        clock.set_millis(2_000);
        cache.put(Bam::new(2, "second"));
        clock.set_millis(3_000);
        cache.put(Bam::new(1, "first"));

        assert_eq!(cache.mru_ids(), vec![1, 2]);
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_reserved_sort_id() {
        let cache = CacheBuilder::<Bam>::without_refresher()
            .with_mru_sort()
            .build()
            .unwrap();
        let result = cache.add_sort(MRU_SORT_ID, |b: &Bam, _| SortKey::Sort(b.id));
        assert!(matches!(result, Err(Error::ReservedSortId(_))));
        assert!(cache.add_sort("by-id", |b: &Bam, _| SortKey::Sort(b.id)).is_ok());
    }
}

// =============================================================================
// Sources and Lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;
    use dbsync::{
        CacheBuilder, DataRefresher, MemoryStore, PersistentObjectLookup, ShutdownHooks,
        SnapshotRefresher, WithShutdown,
    };

    #[test]
    fn test_cache_is_a_lookup() {
        let cache = CacheBuilder::<Bam>::without_refresher().build().unwrap();
        cache.put(Bam::new(1, "one"));
        cache.put(Bam::new(3, "three"));

        let lookup: &dyn PersistentObjectLookup<Bam> = &cache;
        let found = lookup.lookup(&[1, 2, 3]);
        assert_eq!(
            found.iter().map(|o| o.as_ref().map(|b| b.id)).collect::<Vec<_>>(),
            vec![Some(1), None, Some(3)]
        );
    }

    #[test]
    fn test_shutdown_hooks_stop_caches() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Bam::new(1, "one"));
        let cache = Arc::new(
            CacheBuilder::new(DataRefresher::<Bam>::new(
                "bams",
                SnapshotRefresher::new(Arc::clone(&store)),
            ))
            .refresh_on_construction(true)
            .refresh_every(Duration::from_millis(10))
            .build()
            .unwrap(),
        );

        let hooks = ShutdownHooks::new();
        hooks.register("bams", Arc::clone(&cache) as Arc<dyn WithShutdown>);
        hooks.run();
        hooks.run();

        assert!(cache.is_shut_down());
        assert!(cache.refresher().is_shut_down());
        assert!(cache.refresh().is_err());
        assert!(cache.is_empty());
    }
}
