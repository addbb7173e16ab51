//! Cross-thread wake-up support.
//!
//! [`WakeUpHandle`] is the only part of the loop that is safe to use from
//! other threads. Waking is a compare-and-swap on a shared `pending` flag
//! plus, for the thread that wins the transition, exactly one notification
//! on the loop's shared wake endpoint (eventfd on Linux, a self-pipe on
//! kqueue platforms). N concurrent wake calls between two loop steps
//! produce at least one and at most one callback invocation in the next
//! step; the flag is cleared after the callback runs.
//!
//! [`EventObject`] lets the waking thread block until the loop thread has
//! finished running the wake-up callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::backend::Notifier;
use crate::error::Result;

/// Thread-safe handle that wakes an event loop and fires the wake-up
/// request it was created from.
///
/// Cloning is cheap; all clones share the same coalescing flag. The handle
/// stays usable after its request completes without reactivation, but such
/// wakes only interrupt the kernel wait and fire no callback.
#[derive(Clone)]
pub struct WakeUpHandle {
    pending: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl WakeUpHandle {
    pub(crate) fn new(pending: Arc<AtomicBool>, notifier: Arc<Notifier>) -> Self {
        Self { pending, notifier }
    }

    /// Wakes the loop from any thread.
    ///
    /// The first call to transition the pending flag sends one kernel
    /// notification; further calls coalesce until the loop delivers the
    /// callback and clears the flag.
    pub fn wake_up(&self) -> Result<()> {
        if !self.pending.swap(true, Ordering::AcqRel) {
            // This thread won the false -> true exchange and owes the
            // single kernel notification for this delivery.
            self.notifier.notify()?;
        }
        Ok(())
    }

    /// Current value of the coalescing flag.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WakeUpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeUpHandle")
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

/// Auto-reset event for handshakes between an external thread and the loop
/// thread.
///
/// The loop signals the event right after the wake-up callback returns, so
/// `wake_up()` followed by [`wait`](Self::wait) on the waking thread blocks
/// until the callback has actually executed.
#[derive(Default)]
pub struct EventObject {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl EventObject {
    /// Creates a new unsignaled event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the event is signaled, then resets it.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Signals the event, releasing one waiter.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }
}

impl std::fmt::Debug for EventObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventObject")
            .field("signaled", &*self.signaled.lock())
            .finish()
    }
}
