//! Refresh Scheduler
//!
//! Runs a task at a fixed rate on a dedicated thread until stopped.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{after, bounded, select, tick, Receiver, Sender};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::refresh::panic_message;

/// Fixed-rate background task.
pub(crate) struct Scheduler {
    name: String,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Run `task` after `initial_delay`, then every `interval`. A panicking
    /// run is logged and does not end the schedule.
    pub(crate) fn start<F>(
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        task: F,
    ) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(0);
        let worker_name = name.to_string();
        let worker = thread::Builder::new()
            .name(format!("{}-refresh", name))
            .spawn(move || run_schedule(worker_name, initial_delay, interval, stopped, task))
            .map_err(|e| Error::Internal(format!("failed to spawn scheduler: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            stop: Some(stop),
            worker: Some(worker),
        })
    }

    /// Stop the schedule and wait for a run in progress to finish.
    pub(crate) fn stop(&mut self) {
        // Dropping the sender wakes the worker.
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!(schedule = %self.name, "Scheduler terminated abnormally");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_schedule<F: Fn()>(
    name: String,
    initial_delay: Duration,
    interval: Duration,
    stopped: Receiver<()>,
    task: F,
) {
    debug!(schedule = %name, ?initial_delay, ?interval, "Scheduler started");

    let first = after(initial_delay);
    select! {
        recv(stopped) -> _ => return,
        recv(first) -> _ => run_once(&name, &task),
    }

    let ticker = tick(interval);
    loop {
        select! {
            recv(stopped) -> _ => break,
            recv(ticker) -> _ => run_once(&name, &task),
        }
    }

    debug!(schedule = %name, "Exiting scheduler");
}

fn run_once<F: Fn()>(name: &str, task: &F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(
            schedule = %name,
            "Problem with scheduled run: {}",
            panic_message(payload.as_ref())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_runs_repeatedly_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let mut scheduler = Scheduler::start(
            "bams",
            Duration::ZERO,
            Duration::from_millis(10),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 3);

        thread::sleep(Duration::from_millis(40));
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_panicking_run_keeps_schedule() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let mut scheduler = Scheduler::start(
            "bams",
            Duration::ZERO,
            Duration::from_millis(5),
            move || {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_stop_before_first_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let mut scheduler = Scheduler::start(
            "bams",
            Duration::from_secs(60),
            Duration::from_secs(60),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        scheduler.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
