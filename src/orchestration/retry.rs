//! Retry policy for failed task executions.

/// Default number of attempts per task before it is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What to do with a task whose execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back in the queue for a later iteration.
    Requeue,
    /// Mark it failed for good.
    GiveUp,
}

/// Caps how many times one queue entry may be dispatched.
///
/// Attempts are counted on the queue entry itself, so the count survives
/// restarts along with the queue document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Zero means unlimited.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn unlimited() -> Self {
        Self { max_attempts: 0 }
    }

    /// Decide after a failure, given the attempts already made (including
    /// the one that just failed).
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if self.max_attempts == 0 || attempts < self.max_attempts {
            RetryDecision::Requeue
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Attempts left after `attempts`, or `None` when unlimited.
    pub fn remaining(&self, attempts: u32) -> Option<u32> {
        (self.max_attempts != 0).then(|| self.max_attempts.saturating_sub(attempts))
    }
}
