//! Refresh Topic
//!
//! Fan-out hub between one refresher and its listeners. Every registration
//! owns an unbounded queue and a dedicated worker thread, so a slow listener
//! never holds up publishing or any other listener.
//!
//! ```text
//!                    ┌──▶ queue ──▶ worker ──▶ cache map
//! publish(event) ────┼──▶ queue ──▶ worker ──▶ sorter
//!   (read lock)      └──▶ queue ──▶ worker ──▶ indexer
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::listener::{run_listener, run_marker_listener, ListenerId, RefreshListener};
use crate::domain::events::{Envelope, MarkerId};
use crate::domain::{PersistentObject, RefreshEvent};
use crate::error::{Error, Result};

/// One registration: the producer side of a listener queue plus its worker.
struct Subscription<O: PersistentObject> {
    id: ListenerId,
    label: String,
    internal: bool,
    sender: Sender<Envelope<O>>,
    stopped: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<O: PersistentObject> Subscription<O> {
    /// Stop the worker, discarding whatever is still queued. Returns the
    /// number of discarded entries.
    fn stop(self) -> usize {
        self.stopped.store(true, Ordering::Release);
        let discarded = self.sender.len();
        drop(self.sender);

        if let Some(worker) = self.worker {
            // A worker may end up removing itself (or dropping the topic).
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(listener = %self.label, "Listener worker terminated abnormally");
            }
        }
        discarded
    }
}

/// Publish/subscribe hub with per-listener FIFO delivery.
pub struct Topic<O: PersistentObject> {
    name: String,
    subscriptions: RwLock<Vec<Subscription<O>>>,
    next_id: AtomicU64,
    markers: AtomicU64,
    shut_down: AtomicBool,
    weak_self: Weak<Topic<O>>,
}

impl<O: PersistentObject> Topic<O> {
    /// Create a topic. Workers hold a weak reference back to it, hence the `Arc`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak_self| Topic {
            name,
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            markers: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Name of the topic, used in logs and worker thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an event for every registered listener.
    ///
    /// Returns immediately; delivery happens on the listener workers.
    pub fn publish(&self, event: RefreshEvent<O>) {
        self.publish_envelope(Envelope::Data(event));
    }

    /// Enqueue an envelope for every registration and return how many
    /// registrations it was handed to.
    pub(crate) fn publish_envelope(&self, envelope: Envelope<O>) -> usize {
        let subscriptions = self.subscriptions.read();
        for subscription in subscriptions.iter() {
            if subscription.sender.send(envelope.clone()).is_err() {
                debug!(
                    topic = %self.name,
                    listener = %subscription.label,
                    "Listener queue already closed"
                );
            }
        }
        subscriptions.len()
    }

    /// Queue a marker request behind everything already published and return
    /// the listeners expected to acknowledge it.
    pub(crate) fn publish_marker(&self, marker: MarkerId) -> HashSet<ListenerId> {
        let subscriptions = self.subscriptions.read();
        self.markers.fetch_add(1, Ordering::Relaxed);
        let mut expected = HashSet::with_capacity(subscriptions.len());
        for subscription in subscriptions.iter() {
            if subscription.sender.send(Envelope::MarkerReq(marker)).is_ok()
                && !subscription.internal
            {
                expected.insert(subscription.id);
            }
        }
        expected
    }

    /// Number of barrier markers published so far.
    pub fn markers_published(&self) -> u64 {
        self.markers.load(Ordering::Relaxed)
    }

    /// Register a listener. It receives every event published from now on.
    pub fn add_listener(&self, listener: Arc<dyn RefreshListener<O>>) -> Result<ListenerId> {
        let label = listener.name();
        let weak_topic = self.weak_self.clone();
        self.register(label.clone(), false, move |id, queue, stopped| {
            run_listener(id, label, listener, queue, stopped, weak_topic)
        })
    }

    /// Register the temporary listener of a barrier; acknowledgements it sees
    /// are forwarded to `acks`.
    pub(crate) fn add_marker_listener(
        &self,
        acks: Sender<(MarkerId, ListenerId)>,
    ) -> Result<ListenerId> {
        self.register("marker".to_string(), true, move |_, queue, stopped| {
            run_marker_listener(queue, stopped, acks)
        })
    }

    fn register<F>(&self, label: String, internal: bool, body: F) -> Result<ListenerId>
    where
        F: FnOnce(ListenerId, Receiver<Envelope<O>>, Arc<AtomicBool>) + Send + 'static,
    {
        let mut subscriptions = self.subscriptions.write();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown(format!("topic {}", self.name)));
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, queue) = unbounded();
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = Arc::clone(&stopped);

        let worker = thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || body(id, queue, worker_stopped))
            .map_err(|e| Error::Internal(format!("failed to spawn listener worker: {}", e)))?;

        debug!(topic = %self.name, listener = %label, %id, "Listener added");
        subscriptions.push(Subscription {
            id,
            label,
            internal,
            sender,
            stopped,
            worker: Some(worker),
        });
        Ok(id)
    }

    /// Unregister a listener and stop its worker. Events still queued for it
    /// are discarded.
    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        let subscription = {
            let mut subscriptions = self.subscriptions.write();
            let position = subscriptions
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| Error::ListenerNotRegistered(id.to_string()))?;
            subscriptions.remove(position)
        };

        // Joined outside the lock: the worker may need the read side to ack a marker.
        let label = subscription.label.clone();
        let discarded = subscription.stop();
        debug!(topic = %self.name, listener = %label, %id, discarded, "Listener removed");
        Ok(())
    }

    /// Number of registered listeners, not counting barrier internals.
    pub fn listener_count(&self) -> usize {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| !s.internal)
            .count()
    }

    /// Whether `id` is currently registered.
    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.subscriptions.read().iter().any(|s| s.id == id)
    }

    /// True once [`shutdown`](Self::shutdown) ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop every worker. Queued events are dropped and the count of dropped
    /// events is logged per listener. Safe to call more than once.
    pub fn shutdown(&self) {
        let subscriptions = {
            let mut subscriptions = self.subscriptions.write();
            if self.shut_down.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *subscriptions)
        };

        for subscription in subscriptions {
            let label = subscription.label.clone();
            let discarded = subscription.stop();
            if discarded > 0 {
                info!(
                    topic = %self.name,
                    listener = %label,
                    "Shutdown discarded {} unprocessed events",
                    discarded
                );
            }
        }
        debug!(topic = %self.name, "Topic shut down");
    }
}

impl<O: PersistentObject> Drop for Topic<O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
