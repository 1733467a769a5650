//! Per-level bookkeeping of blocked requesters
//!
//! The counter does no locking of its own. It lives inside the arbiter's
//! mutex-protected state, so every call already happens under that lock.

use prm_errors::ResourceError;
use prm_types::{Priority, PriorityLevels};

/// Number of requesters currently blocked at each priority level
#[derive(Debug, Clone)]
pub struct WaitingCounter {
    counts: Box<[usize]>,
}

impl WaitingCounter {
    #[must_use]
    pub fn new(levels: PriorityLevels) -> Self {
        Self {
            counts: vec![0; levels.count()].into_boxed_slice(),
        }
    }

    /// Register one more waiter at `priority`
    pub fn increase(&mut self, priority: Priority) {
        self.counts[priority.index()] += 1;
    }

    /// Withdraw one waiter from `priority`
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::CounterUnderflow` if nobody is registered at
    /// that level. The count is left at zero.
    pub fn decrease(&mut self, priority: Priority) -> Result<(), ResourceError> {
        let slot = &mut self.counts[priority.index()];
        *slot = slot
            .checked_sub(1)
            .ok_or(ResourceError::CounterUnderflow {
                priority: priority.index(),
            })?;
        Ok(())
    }

    #[must_use]
    pub fn count(&self, priority: Priority) -> usize {
        self.counts[priority.index()]
    }

    /// Waiters across every level
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Most urgent level with a waiter that is not already covered by one of
    /// the `signaled` handoffs pending at that level
    ///
    /// `signaled` is indexed by level; pass all zeroes to find the most
    /// urgent non-empty level.
    #[must_use]
    pub fn highest_waiting(
        &self,
        levels: PriorityLevels,
        signaled: &[usize],
    ) -> Option<Priority> {
        levels.descending().find(|priority| {
            let pending = signaled.get(priority.index()).copied().unwrap_or(0);
            self.count(*priority) > pending
        })
    }

    /// Copy of the per-level counts, lowest level first
    #[must_use]
    pub fn to_vec(&self) -> Vec<usize> {
        self.counts.to_vec()
    }
}
