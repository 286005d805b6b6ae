//! Cooperative cancellation for pools and work items.
//!
//! A [`CancelSource`] owns the one-way cancelled flag; any number of
//! [`CancelToken`] handles observe it. Sources can be linked so that
//! cancelling a caller-side source also stops the pool built on top of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

struct Shared {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
    callbacks: Mutex<Vec<Callback>>,
}

impl Shared {
    fn new(parent: Option<CancelToken>) -> Self {
        Shared {
            cancelled: AtomicBool::new(false),
            parent,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Run registrations synchronously on the cancelling thread. The
        // drain happens under the lock so a concurrent registration either
        // lands in this batch or observes the flag and runs immediately.
        let callbacks = {
            let mut slot = self.callbacks.lock().unwrap();
            std::mem::take(&mut *slot)
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// The cancelling half: owns the flag and fires registered callbacks.
pub struct CancelSource {
    shared: Arc<Shared>,
}

impl CancelSource {
    /// Creates an independent source.
    pub fn new() -> Self {
        CancelSource {
            shared: Arc::new(Shared::new(None)),
        }
    }

    /// Creates a source linked to a parent token: cancelling either the
    /// parent or this source cancels tokens handed out by this source.
    pub fn linked_to(parent: &CancelToken) -> Self {
        let shared = Arc::new(Shared::new(Some(parent.clone())));
        let child = Arc::downgrade(&shared);
        parent.on_cancel(move || {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        });
        CancelSource { shared }
    }

    /// Returns an observing token.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: self.shared.clone(),
        }
    }

    /// Requests cancellation. Idempotent; the first call runs every
    /// registered callback before returning.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Whether cancellation has been requested here or on a linked parent.
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing half. Cloning is cheap; all clones see the same flag.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Registers a callback to run when this token's source is cancelled.
    ///
    /// Callbacks run synchronously on the cancelling thread, in
    /// registration order. Registering on an already-cancelled token runs
    /// the callback immediately on the current thread.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        let mut slot = self.shared.callbacks.lock().unwrap();
        if self.shared.cancelled.load(Ordering::Acquire) {
            drop(slot);
            callback();
            return;
        }
        slot.push(Box::new(callback));
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
