//! Data Refresher
//!
//! Pulls changes out of a backing store and broadcasts them to listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use super::listener::{ListenerId, RefreshListener};
use super::marker::ListenerMarker;
use super::topic::Topic;
use crate::domain::{Counter, PersistentObject, RefreshEvent, RefreshResults};
use crate::error::{Error, Result};
use crate::lifecycle::WithShutdown;

/// Something that can detect changes in a backing store.
///
/// An implementation must publish exactly one Created, Changed or Deleted event
/// per change it discovers.
pub trait Refreshable<O: PersistentObject>: Send + Sync {
    /// Look for changes and publish them.
    fn refresh(&self, publisher: &mut Publisher<O>) -> Result<RefreshResults>;
}

impl<O, F> Refreshable<O> for F
where
    O: PersistentObject,
    F: Fn(&mut Publisher<O>) -> Result<RefreshResults> + Send + Sync,
{
    fn refresh(&self, publisher: &mut Publisher<O>) -> Result<RefreshResults> {
        self(publisher)
    }
}

/// Refreshable that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRefresher;

impl<O: PersistentObject> Refreshable<O> for NoopRefresher {
    fn refresh(&self, _publisher: &mut Publisher<O>) -> Result<RefreshResults> {
        Ok(RefreshResults::empty())
    }
}

/// Handed to a [`Refreshable`] for the duration of one refresh. Publishes
/// events and keeps count of them.
pub struct Publisher<O: PersistentObject> {
    topic: Arc<Topic<O>>,
    counter: Counter,
}

impl<O: PersistentObject> Publisher<O> {
    fn new(topic: Arc<Topic<O>>) -> Self {
        Self {
            topic,
            counter: Counter::new(),
        }
    }

    /// Publish an event and count it.
    pub fn publish(&mut self, event: RefreshEvent<O>) {
        self.counter.inc(event.kind());
        self.topic.publish(event);
    }

    /// Publish a `Created` event for `object`.
    pub fn created(&mut self, object: impl Into<Arc<O>>) {
        self.publish(RefreshEvent::created(object));
    }

    /// Publish a `Changed` event for `object`.
    pub fn changed(&mut self, object: impl Into<Arc<O>>) {
        self.publish(RefreshEvent::changed(object));
    }

    /// Publish a `Deleted` event for `id`.
    pub fn deleted(&mut self, id: O::Id) {
        self.publish(RefreshEvent::deleted(id));
    }

    /// Counts of everything published so far.
    pub fn results(&self) -> RefreshResults {
        self.counter.as_results()
    }
}

/// Owns the topic of one backing store and the source that feeds it.
pub struct DataRefresher<O: PersistentObject> {
    name: String,
    topic: Arc<Topic<O>>,
    marker: ListenerMarker<O>,
    source: Box<dyn Refreshable<O>>,
    refreshing: Mutex<()>,
    shut_down: AtomicBool,
}

impl<O: PersistentObject> DataRefresher<O> {
    /// Create a refresher named `name` driven by `source`.
    pub fn new(name: impl Into<String>, source: impl Refreshable<O> + 'static) -> Self {
        let name = name.into();
        let topic = Topic::new(name.clone());
        Self {
            marker: ListenerMarker::new(Arc::clone(&topic)),
            topic,
            name,
            source: Box::new(source),
            refreshing: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a refresher from a closure.
    pub fn from_fn<F>(name: impl Into<String>, source: F) -> Self
    where
        F: Fn(&mut Publisher<O>) -> Result<RefreshResults> + Send + Sync + 'static,
    {
        Self::new(name, source)
    }

    /// A refresher that never reports changes. Events can still be fed in
    /// through [`publish`](Self::publish).
    pub fn noop() -> Self {
        Self::new("noop", NoopRefresher)
    }

    /// Name of this refresher.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look for changes and publish them. Concurrent calls are serialized.
    ///
    /// Returns once the events are published, usually before listeners have
    /// processed them; see [`refresh_and_wait`](Self::refresh_and_wait).
    #[instrument(skip(self), fields(refresher = %self.name))]
    pub fn refresh(&self) -> Result<RefreshResults> {
        let _refreshing = self.refreshing.lock();
        if self.is_shut_down() {
            return Err(Error::ShutDown(format!("refresher {}", self.name)));
        }

        let mut publisher = self.publisher();
        let results = self.source.refresh(&mut publisher)?;

        if results.is_empty() {
            debug!("Refresh found no changes");
        } else {
            info!(
                found = results.found,
                created = results.created,
                changed = results.changed,
                deleted = results.deleted,
                elapsed_ms = results.elapsed_millis,
                "Refresh complete"
            );
        }
        Ok(results)
    }

    pub(crate) fn publisher(&self) -> Publisher<O> {
        Publisher::new(Arc::clone(&self.topic))
    }

    /// Publish an event directly, bypassing the source.
    pub fn publish(&self, event: RefreshEvent<O>) {
        self.topic.publish(event);
    }

    /// Register a listener for this refresher's events.
    pub fn add_listener(&self, listener: Arc<dyn RefreshListener<O>>) -> Result<ListenerId> {
        self.topic.add_listener(listener)
    }

    /// Unregister a listener.
    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.topic.remove_listener(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.topic.listener_count()
    }

    /// Block until all listeners have caught up with everything published so
    /// far. `None` waits without limit.
    pub fn wait_for_listeners(&self, timeout: Option<Duration>) -> Result<()> {
        self.marker.block_until_next_marker(timeout)
    }

    /// Number of barrier markers published on the topic so far.
    pub fn markers_published(&self) -> u64 {
        self.topic.markers_published()
    }

    /// Refresh, then wait for every listener to process the results.
    pub fn refresh_and_wait(&self, timeout: Option<Duration>) -> Result<RefreshResults> {
        let results = self.refresh()?;
        self.wait_for_listeners(timeout)?;
        Ok(results)
    }

    /// True once [`shutdown`](Self::shutdown) ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the topic and every listener worker. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.topic.shutdown();
        info!(refresher = %self.name, "Refresher shut down");
    }
}

impl<O: PersistentObject> WithShutdown for DataRefresher<O> {
    fn shutdown(&self) {
        DataRefresher::shutdown(self);
    }
}

impl<O: PersistentObject> Drop for DataRefresher<O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
