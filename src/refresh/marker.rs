//! Listener Marker
//!
//! Quiescence barrier built on top of a [`Topic`]. A marker request is queued
//! behind everything already published; each listener acknowledges it once it
//! reaches the head of its queue. When all acknowledgements are in, every
//! event published before the marker has been fully processed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::listener::ListenerId;
use super::topic::Topic;
use crate::domain::events::MarkerId;
use crate::domain::PersistentObject;
use crate::error::{Error, Result};

/// How often a waiting barrier checks whether the listeners it waits for are
/// still registered.
const LIVENESS_CHECK: Duration = Duration::from_millis(50);

/// Barrier over the listeners of one topic. Calls are serialized.
pub struct ListenerMarker<O: PersistentObject> {
    topic: Arc<Topic<O>>,
    serial: Mutex<()>,
}

impl<O: PersistentObject> ListenerMarker<O> {
    /// Create a barrier for `topic`.
    pub fn new(topic: Arc<Topic<O>>) -> Self {
        Self {
            topic,
            serial: Mutex::new(()),
        }
    }

    /// Block until every listener registered at the time of the call has
    /// processed everything published before it.
    ///
    /// Returns immediately when there are no listeners. With a `timeout`, fails
    /// with [`Error::Overdue`] if the acknowledgements do not arrive in time;
    /// the topic is left intact either way.
    #[instrument(skip(self), fields(topic = %self.topic.name()))]
    pub fn block_until_next_marker(&self, timeout: Option<Duration>) -> Result<()> {
        let _serial = self.serial.lock();

        if self.topic.listener_count() == 0 {
            return Ok(());
        }

        let (acks, ack_queue) = unbounded();
        let marker_listener = self.topic.add_marker_listener(acks)?;
        let result = self.await_acks(&ack_queue, timeout);

        if let Err(e) = self.topic.remove_listener(marker_listener) {
            warn!("Failed to remove marker listener: {}", e);
        }
        result
    }

    fn await_acks(
        &self,
        ack_queue: &Receiver<(MarkerId, ListenerId)>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let marker = Uuid::new_v4();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut pending = self.topic.publish_marker(marker);
        debug!(%marker, expected = pending.len(), "Marker published");

        while !pending.is_empty() {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Overdue {
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    (deadline - now).min(LIVENESS_CHECK)
                }
                None => LIVENESS_CHECK,
            };

            match ack_queue.recv_timeout(slice) {
                Ok((acked, sender)) => {
                    if acked == marker {
                        pending.remove(&sender);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Listeners removed after the marker went out will never answer.
                    pending.retain(|id| self.topic.is_registered(*id));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::ShutDown(format!("topic {}", self.topic.name())));
                }
            }
        }

        debug!(%marker, "All listeners acknowledged marker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::testing::Bam;
    use crate::domain::RefreshEvent;
    use crate::refresh::RefreshListener;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn slow_counter(
        delay: Duration,
    ) -> (Arc<dyn RefreshListener<Bam>>, Arc<AtomicUsize>) {
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
    fn test_no_listeners_returns_immediately() {
        let topic = Topic::<Bam>::new("bams");
        let marker = ListenerMarker::new(Arc::clone(&topic));
        marker
            .block_until_next_marker(Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(topic.listener_count(), 0);
        assert_eq!(topic.markers_published(), 0);
    }

    #[test]
    fn test_waits_for_all_listeners() {
        let topic = Topic::<Bam>::new("bams");
        let marker = ListenerMarker::new(Arc::clone(&topic));
        let (fast, fast_count) = slow_counter(Duration::ZERO);
        let (slow, slow_count) = slow_counter(Duration::from_millis(2));
        topic.add_listener(fast).unwrap();
        topic.add_listener(slow).unwrap();

        for id in 0..50 {
            topic.publish(RefreshEvent::deleted(id));
        }
        marker.block_until_next_marker(None).unwrap();

        assert_eq!(topic.markers_published(), 1);
        assert_eq!(fast_count.load(Ordering::SeqCst), 50);
        assert_eq!(slow_count.load(Ordering::SeqCst), 50);
        assert_eq!(topic.listener_count(), 2);
    }

    #[test]
    fn test_overdue_leaves_topic_intact() {
        let topic = Topic::<Bam>::new("bams");
        let marker = ListenerMarker::new(Arc::clone(&topic));
        let (slow, slow_count) = slow_counter(Duration::from_millis(200));
        topic.add_listener(slow).unwrap();

        topic.publish(RefreshEvent::deleted(1));
        let result = marker.block_until_next_marker(Some(Duration::from_millis(10)));
        assert_matches!(result, Err(Error::Overdue { .. }));
        assert_eq!(topic.listener_count(), 1);

        marker.block_until_next_marker(None).unwrap();
        assert_eq!(slow_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removed_while_waiting() {
        let topic = Topic::<Bam>::new("bams");
        let marker = ListenerMarker::new(Arc::clone(&topic));
        let (slow, _) = slow_counter(Duration::from_millis(100));
        let id = topic.add_listener(slow).unwrap();
        topic.publish(RefreshEvent::deleted(1));
        topic.publish(RefreshEvent::deleted(2));

        let remover = {
            let topic = Arc::clone(&topic);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                topic.remove_listener(id).unwrap();
            })
        };

        marker
            .block_until_next_marker(Some(Duration::from_secs(5)))
            .unwrap();
        remover.join().unwrap();
        assert_eq!(topic.listener_count(), 0);
    }
}
