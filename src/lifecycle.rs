//! Shutdown Hooks
//!
//! A host process registers every component that owns threads here and runs
//! the hooks once on the way out.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::refresh::panic_message;

/// A component with background resources that must be released explicitly.
pub trait WithShutdown: Send + Sync {
    /// Release the resources. Must be safe to call more than once.
    fn shutdown(&self);
}

struct Hook {
    label: String,
    target: Arc<dyn WithShutdown>,
}

/// Ordered registry of shutdown hooks.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<Hook>>,
    ran: Mutex<bool>,
}

impl ShutdownHooks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target`. Hooks run in registration order. Once the hooks
    /// have run, `target` is shut down right away instead.
    pub fn register(&self, label: impl Into<String>, target: Arc<dyn WithShutdown>) {
        let hook = Hook {
            label: label.into(),
            target,
        };
        {
            let ran = self.ran.lock();
            if !*ran {
                debug!(hook = %hook.label, "Shutdown hook registered");
                self.hooks.lock().push(hook);
                return;
            }
        }
        warn!(hook = %hook.label, "Shutdown hooks already ran, shutting down immediately");
        hook.run();
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }

    /// Run every hook once. A panicking hook is logged and the rest still run.
    /// Later calls do nothing.
    pub fn run(&self) {
        {
            let mut ran = self.ran.lock();
            if *ran {
                return;
            }
            *ran = true;
        }

        let hooks = std::mem::take(&mut *self.hooks.lock());
        info!("Running {} shutdown hooks", hooks.len());
        for hook in hooks {
            hook.run();
        }
    }
}

impl Hook {
    /// Shut the target down. A panic is logged, not propagated.
    fn run(&self) {
        let target = Arc::clone(&self.target);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| target.shutdown())) {
            error!(
                hook = %self.label,
                "Problem shutting down: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}
