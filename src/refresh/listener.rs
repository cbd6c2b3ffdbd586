//! Refresh Listeners
//!
//! The listener contract plus the worker loop that drives one listener off its
//! private queue.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, trace};

use super::topic::Topic;
use crate::domain::events::{Envelope, MarkerId};
use crate::domain::{PersistentObject, RefreshEvent};
use crate::error::Result;

/// Handle identifying one registration with a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives the refresh events of one refresher.
///
/// Events are handed over one at a time, in publish order, on a thread owned by
/// the topic. An `Err` or a panic is logged and the next event is delivered;
/// events are never redelivered.
pub trait RefreshListener<O: PersistentObject>: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &RefreshEvent<O>) -> Result<()>;

    /// Label used in log output.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl<O, F> RefreshListener<O> for F
where
    O: PersistentObject,
    F: Fn(&RefreshEvent<O>) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: &RefreshEvent<O>) -> Result<()> {
        self(event)
    }

    fn name(&self) -> String {
        "fn-listener".to_string()
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Worker loop of an ordinary listener.
///
/// Marker requests are answered by publishing an acknowledgement through the
/// topic, which happens only after every event queued ahead of the request has
/// been handled.
pub(crate) fn run_listener<O: PersistentObject>(
    id: ListenerId,
    label: String,
    listener: Arc<dyn RefreshListener<O>>,
    queue: Receiver<Envelope<O>>,
    stopped: Arc<AtomicBool>,
    topic: Weak<Topic<O>>,
) {
    debug!(listener = %label, id = %id, "Listener worker started");

    while let Ok(envelope) = queue.recv() {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        match envelope {
            Envelope::Data(event) => deliver(&label, listener.as_ref(), &event),
            Envelope::MarkerReq(marker) => {
                trace!(listener = %label, %marker, "Acknowledging marker");
                if let Some(topic) = topic.upgrade() {
                    topic.publish_envelope(Envelope::MarkerAck { marker, sender: id });
                }
            }
            Envelope::MarkerAck { .. } => {}
        }
    }

    debug!(listener = %label, id = %id, "Listener worker stopped");
}

/// Worker loop of a barrier's temporary listener: forwards acknowledgements
/// to the waiting barrier and ignores everything else.
pub(crate) fn run_marker_listener<O: PersistentObject>(
    queue: Receiver<Envelope<O>>,
    stopped: Arc<AtomicBool>,
    acks: Sender<(MarkerId, ListenerId)>,
) {
    while let Ok(envelope) = queue.recv() {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        if let Envelope::MarkerAck { marker, sender } = envelope {
            if acks.send((marker, sender)).is_err() {
                break;
            }
        }
    }
}

fn deliver<O: PersistentObject>(
    label: &str,
    listener: &dyn RefreshListener<O>,
    event: &RefreshEvent<O>,
) {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(listener = %label, ?event, "Problem processing event: {}", e);
        }
        Err(payload) => {
            error!(
                listener = %label,
                ?event,
                "Listener panicked while processing event: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

/// Best effort rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::testing::Bam;
    use crate::error::Error;
    use crossbeam::channel::unbounded;
    use parking_lot::Mutex;
    use std::thread;

    #[test]
    fn test_listener_id_display() {
        assert_eq!(ListenerId(3).to_string(), "listener-3");
    }

    #[test]
    fn test_worker_survives_errors_and_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let listener: Arc<dyn RefreshListener<Bam>> =
            Arc::new(move |event: &RefreshEvent<Bam>| -> Result<()> {
                let id = *event.id();
                recorded.lock().push(id);
                match id {
                    2 => Err(Error::Listener("bad event".to_string())),
                    3 => panic!("boom"),
                    _ => Ok(()),
                }
            });

        let (tx, rx) = unbounded();
        let stopped = Arc::new(AtomicBool::new(false));
        let worker = {
            let stopped = Arc::clone(&stopped);
            thread::spawn(move || {
                run_listener(
                    ListenerId(1),
                    "test".to_string(),
                    listener,
                    rx,
                    stopped,
                    Weak::new(),
                )
            })
        };

        for id in 1..=4 {
            tx.send(Envelope::Data(RefreshEvent::deleted(id))).unwrap();
        }
        drop(tx);
        worker.join().unwrap();

        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_marker_listener_forwards_acks_only() {
        let (tx, rx) = unbounded::<Envelope<Bam>>();
        let (ack_tx, ack_rx) = unbounded();
        let marker = uuid::Uuid::new_v4();

        tx.send(Envelope::Data(RefreshEvent::deleted(1))).unwrap();
        tx.send(Envelope::MarkerReq(marker)).unwrap();
        tx.send(Envelope::MarkerAck {
            marker,
            sender: ListenerId(9),
        })
        .unwrap();
        drop(tx);

        run_marker_listener(rx, Arc::new(AtomicBool::new(false)), ack_tx);

        assert_eq!(ack_rx.try_iter().collect::<Vec<_>>(), vec![(marker, ListenerId(9))]);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("kaput")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "kaput");
    }
}
