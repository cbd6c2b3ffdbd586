//! Seeding Worker
//!
//! Fills newly added sorters and indexers from the cache contents on a single
//! background thread, so `add_sort` / `add_index` never block on it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::refresh::panic_message;

type Job = Box<dyn FnOnce() -> Result<usize> + Send>;

struct SeedJob {
    label: String,
    job: Job,
    done: Sender<Result<usize>>,
    finished: Finished,
}

/// Raises the shared flag when dropped, whether the job ran or was discarded.
struct Finished(Arc<AtomicBool>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Completion handle of a seed job. Yields the number of entries processed.
#[derive(Debug)]
pub struct SeedHandle {
    label: String,
    done: Receiver<Result<usize>>,
    finished: Arc<AtomicBool>,
}

impl SeedHandle {
    /// Block until seeding finished.
    pub fn wait(self) -> Result<usize> {
        self.done
            .recv()
            .map_err(|_| Error::ShutDown(format!("seeding of {}", self.label)))?
    }

    /// Block until seeding finished or `timeout` elapsed.
    pub fn wait_timeout(self, timeout: Duration) -> Result<usize> {
        match self.done.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Overdue { timeout }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::ShutDown(format!("seeding of {}", self.label)))
            }
        }
    }

    /// True once the job has completed (or can no longer complete).
    pub fn is_finished(&self) -> bool {
        !self.done.is_empty() || self.finished.load(Ordering::Acquire)
    }
}

/// Single-threaded job runner.
pub(crate) struct Seeder {
    cache: String,
    jobs: Mutex<Option<Sender<SeedJob>>>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Seeder {
    pub(crate) fn start(cache: &str) -> Result<Self> {
        let (jobs, queue) = unbounded::<SeedJob>();
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = Arc::clone(&stopped);
        let worker_cache = cache.to_string();

        let worker = thread::Builder::new()
            .name(format!("{}-seeder", cache))
            .spawn(move || run_seeder(worker_cache, queue, worker_stopped))
            .map_err(|e| Error::Internal(format!("failed to spawn seeder: {}", e)))?;

        Ok(Self {
            cache: cache.to_string(),
            jobs: Mutex::new(Some(jobs)),
            stopped,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `job`; it runs after every job submitted before it.
    pub(crate) fn submit<F>(&self, label: String, job: F) -> Result<SeedHandle>
    where
        F: FnOnce() -> Result<usize> + Send + 'static,
    {
        let (done, handle) = bounded(1);
        let finished = Arc::new(AtomicBool::new(false));
        let jobs = self.jobs.lock();
        let sender = jobs
            .as_ref()
            .ok_or_else(|| Error::ShutDown(format!("seeder of cache {}", self.cache)))?;
        sender
            .send(SeedJob {
                label: label.clone(),
                job: Box::new(job),
                done,
                finished: Finished(Arc::clone(&finished)),
            })
            .map_err(|_| Error::ShutDown(format!("seeder of cache {}", self.cache)))?;
        Ok(SeedHandle {
            label,
            done: handle,
            finished,
        })
    }

    /// Stop the worker. Jobs that have not started are dropped, which their
    /// handles report as [`Error::ShutDown`].
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.jobs.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!(cache = %self.cache, "Seeder terminated abnormally");
            }
        }
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_seeder(cache: String, queue: Receiver<SeedJob>, stopped: Arc<AtomicBool>) {
    debug!(cache = %cache, "Seeder started");
    while let Ok(SeedJob {
        label,
        job,
        done,
        finished: _finished,
    }) = queue.recv()
    {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => Err(Error::Seed {
                structure: label.clone(),
                cache: cache.clone(),
                reason: panic_message(payload.as_ref()),
            }),
        };
        match &result {
            Ok(count) => info!(cache = %cache, structure = %label, count, "Seeding finished"),
            Err(e) => error!(cache = %cache, structure = %label, "Problem seeding: {}", e),
        }
        // The caller may have dropped its handle.
        let _ = done.send(result);
    }
    debug!(cache = %cache, "Seeder stopped");
}
