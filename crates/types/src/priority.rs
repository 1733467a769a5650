//! Priority levels and the values that identify them

use prm_errors::ResourceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;

/// Returned in place of a priority when a release found nobody waiting.
///
/// Negative, so it can never collide with a legal level.
pub const NONE_WAITING: i64 = -1;

/// Upper bound on the level count. Every level owns a condition queue.
pub const MAX_LEVELS: usize = 1 << 16;

/// Number of distinct priority levels an arbiter serves.
///
/// Fixed at construction. Levels are `0..count()`, and `count() - 1` is the
/// most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct PriorityLevels(NonZeroUsize);

impl PriorityLevels {
    /// Create a level count in `1..=MAX_LEVELS`
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidLevelCount` when `count` is zero, since
    /// no priority could ever be valid, or larger than [`MAX_LEVELS`].
    pub fn new(count: usize) -> Result<Self, ResourceError> {
        NonZeroUsize::new(count)
            .filter(|count| count.get() <= MAX_LEVELS)
            .map(Self)
            .ok_or(ResourceError::InvalidLevelCount {
                count,
                max: MAX_LEVELS,
            })
    }

    #[must_use]
    pub fn count(self) -> usize {
        self.0.get()
    }

    /// The most urgent level
    #[must_use]
    pub fn highest(self) -> Priority {
        Priority(self.0.get() - 1)
    }

    /// Check a caller-supplied priority against `[0, count)`
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidPriority` for negative values and for
    /// values at or above the level count.
    pub fn validate(self, raw: i64) -> Result<Priority, ResourceError> {
        usize::try_from(raw)
            .ok()
            .filter(|index| *index < self.count())
            .map(Priority)
            .ok_or(ResourceError::InvalidPriority {
                priority: raw,
                levels: self.count(),
            })
    }

    /// Every level, most urgent first
    pub fn descending(self) -> impl Iterator<Item = Priority> {
        (0..self.count()).rev().map(Priority)
    }
}

impl TryFrom<usize> for PriorityLevels {
    type Error = ResourceError;

    fn try_from(count: usize) -> Result<Self, Self::Error> {
        Self::new(count)
    }
}

impl From<PriorityLevels> for usize {
    fn from(levels: PriorityLevels) -> Self {
        levels.count()
    }
}

impl fmt::Display for PriorityLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A priority that has been validated against a `PriorityLevels`
///
/// Only `PriorityLevels` hands these out, so holding one means the index is
/// in range for the arbiter it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(usize);

impl Priority {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of releasing the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "priority")]
pub enum Handoff {
    /// A waiter at this level was woken and now holds the resource
    Signaled(Priority),
    /// Nobody was waiting; the resource is free
    NoneWaiting,
}

impl Handoff {
    /// Integer form: the signaled level, or [`NONE_WAITING`]
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn code(self) -> i64 {
        match self {
            // index < MAX_LEVELS
            Self::Signaled(priority) => priority.index() as i64,
            Self::NoneWaiting => NONE_WAITING,
        }
    }

    #[must_use]
    pub fn signaled(self) -> Option<Priority> {
        match self {
            Self::Signaled(priority) => Some(priority),
            Self::NoneWaiting => None,
        }
    }
}

impl fmt::Display for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signaled(priority) => write!(f, "signaled priority {priority}"),
            Self::NoneWaiting => write!(f, "none waiting"),
        }
    }
}
