//! Scoped ownership of the arbitrated resource

use crate::manager::PriorityResourceManager;
use prm_errors::ResourceError;
use prm_types::{Handoff, Priority};
use std::ops::Deref;
use tracing::error;

/// Proof that the current thread holds the resource
///
/// Dereferences to the resource. Call [`release`](Self::release) to learn
/// who was handed the resource next; dropping the guard releases it too.
#[must_use = "dropping the guard releases the resource immediately"]
pub struct ResourceGuard<'a, R> {
    manager: &'a PriorityResourceManager<R>,
    priority: Priority,
    released: bool,
}

impl<'a, R> ResourceGuard<'a, R> {
    pub(crate) fn new(manager: &'a PriorityResourceManager<R>, priority: Priority) -> Self {
        Self {
            manager,
            priority,
            released: false,
        }
    }

    /// Level the resource was requested at
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Release the resource, reporting which waiter (if any) received it
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::NotHeld` if the resource was already released
    /// behind the guard's back.
    pub fn release(mut self) -> Result<Handoff, ResourceError> {
        self.released = true;
        self.manager.release_resource()
    }
}

impl<R> Deref for ResourceGuard<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.manager.resource()
    }
}

impl<R> Drop for ResourceGuard<'_, R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.manager.release_resource() {
            error!(priority = %self.priority, error = %err, "failed to release resource on drop");
        }
    }
}

impl<R> std::fmt::Debug for ResourceGuard<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("priority", &self.priority)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
