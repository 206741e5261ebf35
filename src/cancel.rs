//! Cooperative cancellation for blocking waits.
//!
//! Waiters (pool checkout, server selection, reply receipt) register a wake
//! callback for the duration of their wait. Cancelling the token sets the flag
//! first and then runs every registered callback, so a waiter that registers
//! and then checks `is_cancelled` never misses a cancellation.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type WakeCallback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicUsize,
    callbacks: Mutex<Vec<(usize, WakeCallback)>>,
}

/// A cloneable handle that can cancel any wait it was passed to.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        CancellationToken::new()
    }
}

/// Keeps a wake callback registered until dropped.
pub struct Registration {
    token: CancellationToken,
    id: usize,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut callbacks) = self.token.inner.callbacks.lock() {
            callbacks.retain(|&(id, _)| id != self.id);
        }
    }
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicUsize::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token that is never cancelled by anyone else.
    pub fn none() -> CancellationToken {
        CancellationToken::new()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels the token and wakes every registered waiter.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        // Callbacks typically lock the waiter's own mutex, so they must run
        // without our callback lock held.
        let callbacks = match self.inner.callbacks.lock() {
            Ok(mut guard) => guard.drain(..).collect::<Vec<_>>(),
            Err(_) => return,
        };

        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Registers `wake` to run when the token is cancelled.
    pub fn register<F>(&self, wake: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut callbacks) = self.inner.callbacks.lock() {
            callbacks.push((id, Box::new(wake)));
        }

        Registration {
            token: self.clone(),
            id: id,
        }
    }
}
