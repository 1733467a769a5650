//! Resource arbitration error types

use std::borrow::Cow;

use crate::UserFacingError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ResourceError {
    #[error("invalid priority {priority}: expected a level in [0, {levels})")]
    InvalidPriority { priority: i64, levels: usize },

    #[error("wait for resource at priority {priority} was cancelled")]
    Cancelled { priority: usize },

    #[error("wait for resource at priority {priority} timed out after {timeout_ms}ms")]
    TimedOut { priority: usize, timeout_ms: u64 },

    #[error("priority level count must be between 1 and {max}, got {count}")]
    InvalidLevelCount { count: usize, max: usize },

    #[error("resource use budget of {max_uses} is spent")]
    UsesExhausted { max_uses: u64 },

    #[error("resource released while not held")]
    NotHeld,

    #[error("waiting count underflow at priority {priority}")]
    CounterUnderflow { priority: usize },
}

impl ResourceError {
    /// Whether a blocked wait was given up before the resource was handed over.
    ///
    /// The manager has already withdrawn the waiter's registration when this
    /// error reaches the caller.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::TimedOut { .. })
    }

    /// Whether the error signals a broken invariant rather than a runtime condition.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::NotHeld | Self::CounterUnderflow { .. })
    }
}

impl UserFacingError for ResourceError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidPriority { .. } => {
                Some("Use a priority between 0 and the configured level count minus one.")
            }
            Self::Cancelled { .. } | Self::TimedOut { .. } => {
                Some("The request was withdrawn; submit it again to keep waiting.")
            }
            Self::InvalidLevelCount { .. } => Some("Configure at least one priority level."),
            Self::UsesExhausted { .. } => {
                Some("Create a new manager or raise max_uses to grant further uses.")
            }
            Self::NotHeld => Some("Only the current holder may release the resource."),
            Self::CounterUnderflow { .. } => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidPriority { .. } | Self::Cancelled { .. } | Self::TimedOut { .. }
        )
    }

    fn user_code(&self) -> Option<&'static str> {
        let code = match self {
            Self::InvalidPriority { .. } => "resource.invalid_priority",
            Self::Cancelled { .. } => "resource.cancelled",
            Self::TimedOut { .. } => "resource.timed_out",
            Self::InvalidLevelCount { .. } => "resource.invalid_level_count",
            Self::UsesExhausted { .. } => "resource.uses_exhausted",
            Self::NotHeld => "resource.not_held",
            Self::CounterUnderflow { .. } => "resource.counter_underflow",
        };
        Some(code)
    }
}
