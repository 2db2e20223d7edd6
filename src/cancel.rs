//! Cooperative cancellation shared by the polling loop, the dispatcher,
//! storage adapter calls, and handler invocations.
//!
//! A single [`CancelToken`] covers the whole processor. Handlers are expected
//! to observe it for cooperative shutdown; if they ignore it, the drain phase
//! times out and `stop` reports the failure while still transitioning the
//! processor to `stopped`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Clonable cancellation token. All clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent; wakes every pending `cancelled()` wait.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation has been signalled.
    pub async fn cancelled(&self) {
        // The notified future must be created before the flag re-check so a
        // cancel() landing between the check and the await is not lost.
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
