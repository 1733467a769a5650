//! Cancellation of blocked resource requests

use crate::manager::Shared;
use parking_lot::Mutex;
use prm_types::Priority;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handle that abandons the waits it was passed to
///
/// Clones share one cancellation flag. Cancelling removes every request that
/// is currently blocked with this token from the arbiter's waiting counts
/// before `cancel` returns, then wakes them; each returns
/// `ResourceError::Cancelled`. A handoff that was already on its way to one of
/// them is passed to the next waiter. Only a request that took the resource
/// before the cancellation keeps it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    waiters: Mutex<Vec<Registration>>,
}

#[derive(Debug)]
struct Registration {
    id: u64,
    shared: Weak<Shared>,
    priority: Priority,
    enrolled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every wait using this token. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        // Drain before withdrawing so the token lock is never held together
        // with an arbiter lock.
        let waiters = std::mem::take(&mut *self.inner.waiters.lock());
        for registration in waiters {
            if let Some(shared) = registration.shared.upgrade() {
                shared.withdraw_cancelled(registration.priority, &registration.enrolled);
            }
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Record that a request is about to block at `priority` on `shared`
    ///
    /// `enrolled` is set by the request while it is counted as waiting.
    /// Registering must happen before the request checks `is_cancelled`
    /// under the arbiter lock, otherwise a concurrent `cancel` could miss it.
    pub(crate) fn register(
        &self,
        shared: &Arc<Shared>,
        priority: Priority,
        enrolled: &Arc<AtomicBool>,
    ) -> Registered<'_> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.waiters.lock().push(Registration {
            id,
            shared: Arc::downgrade(shared),
            priority,
            enrolled: Arc::clone(enrolled),
        });
        Registered { token: self, id }
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner.waiters.lock().len()
    }
}

/// Removes its registration from the token when dropped
pub(crate) struct Registered<'a> {
    token: &'a CancellationToken,
    id: u64,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.token
            .inner
            .waiters
            .lock()
            .retain(|registration| registration.id != self.id);
    }
}
