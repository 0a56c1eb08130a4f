//! Process shutdown hooks
//!
//! Mounts register a best-effort cleanup here; the host runs the hooks
//! from its own shutdown path (signal handler, end of `main`). Once the
//! hooks have run the registry is closed and refuses new registrations.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registry {
    hooks: Vec<(String, Hook)>,
    closed: bool,
}

/// Shared registry of cleanup actions to run at process shutdown
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    registry: Arc<Mutex<Registry>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether new hooks can still be registered
    pub fn accepts_hooks(&self) -> bool {
        !self.registry.lock().closed
    }

    /// Register a hook; returns `false` when shutdown has already started
    pub fn register(&self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) -> bool {
        let mut registry = self.registry.lock();
        if registry.closed {
            return false;
        }
        let name = name.into();
        debug!("Registered shutdown hook {:?}", name);
        registry.hooks.push((name, Box::new(hook)));
        true
    }

    /// Run every registered hook, most recent first, and close the registry
    ///
    /// A panicking hook is logged and does not stop the others. Returns the
    /// number of hooks run; later calls run nothing.
    pub fn run(&self) -> usize {
        let hooks = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            std::mem::take(&mut registry.hooks)
        };

        let count = hooks.len();
        for (name, hook) in hooks.into_iter().rev() {
            debug!("Running shutdown hook {:?}", name);
            if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
                warn!("Shutdown hook {:?} panicked", name);
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.registry.lock().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
