use log::{debug, warn};

use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::apm::event::ClusterEvent;
use crate::error::Result;

pub type EventHook = Box<dyn Fn(&ClusterEvent) + Send + Sync>;

/// Fans events out to the registered hooks.
pub struct Listener {
    no_hooks: AtomicBool,
    hooks: RwLock<Vec<EventHook>>,
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new()
    }
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_hooks: AtomicBool::new(true),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(&ClusterEvent) + Send + Sync + 'static,
    {
        let mut guard = self.hooks.write()?;
        self.no_hooks.store(false, Ordering::SeqCst);
        guard.deref_mut().push(Box::new(hook));
        Ok(())
    }

    /// Logs the event and runs every hook. A panicking hook is logged and
    /// skipped.
    pub fn emit(&self, event: &ClusterEvent) {
        debug!("{}", event);

        if self.no_hooks.load(Ordering::SeqCst) {
            return;
        }

        let guard = match self.hooks.read() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        for hook in guard.deref().iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
                warn!("an event hook panicked while handling: {}", event);
            }
        }
    }
}
