/// Action to take after a backoff attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Spin briefly and look again
    Retry,
    /// Yield the current thread and look again
    Yield,
    /// Give up; the waiting transaction aborts
    Abort,
}

/// Pluggable backoff strategy for waiting on pending versions.
///
/// A reader or validator that meets a version still owned by an inflight
/// writer asks the strategy what to do on every attempt.
pub trait BackoffStrategy: Send + Sync {
    /// Determine the action to take for a given attempt number (0-indexed)
    fn backoff(&self, attempt: u32) -> BackoffAction;
}

/// Default backoff: spin for the first half of `limit` attempts, yield for
/// the second half, then abort.
#[derive(Debug, Clone, Copy)]
pub struct SpinThenYield {
    limit: u32,
}

impl SpinThenYield {
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }
}

impl BackoffStrategy for SpinThenYield {
    fn backoff(&self, attempt: u32) -> BackoffAction {
        if attempt >= self.limit {
            BackoffAction::Abort
        } else if attempt < self.limit / 2 {
            for _ in 0..1u32 << attempt.min(6) {
                std::hint::spin_loop();
            }
            BackoffAction::Retry
        } else {
            BackoffAction::Yield
        }
    }
}

/// Never waits: the first pending version aborts the attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWait;

impl BackoffStrategy for NoWait {
    fn backoff(&self, _attempt: u32) -> BackoffAction {
        BackoffAction::Abort
    }
}
