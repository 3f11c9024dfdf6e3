//! Retry policy.
//!
//! A pure function from (attempt count, failure kind) to a decision. No
//! control flow hides here: the orchestrator turns the decision into a
//! state transition, nothing is raised or caught.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::model::ErrorKind;

/// What to do with a failed item. Recomputed from the item's state every
/// time; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again on the next admission, no extra delay.
    Proceed,
    /// Try again after the given delay.
    Defer(Duration),
    /// Stop retrying; the item goes to Failed.
    Abandon,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Decide the fate of an item that has failed `attempt_count` times,
    /// most recently with `kind`.
    ///
    /// Permanent failures are abandoned immediately. Rate-limited failures
    /// with attempts remaining proceed without extra delay — the admission
    /// controller already owns pacing, and stacking a backoff on top of its
    /// reported reset time would double-penalize. Other transient failures
    /// back off linearly with the attempt count, capped.
    pub fn decide(&self, attempt_count: u32, kind: ErrorKind) -> RetryDecision {
        if kind.is_permanent() {
            return RetryDecision::Abandon;
        }
        if attempt_count >= self.max_attempts {
            return RetryDecision::Abandon;
        }
        if kind == ErrorKind::RateLimited {
            return RetryDecision::Proceed;
        }
        RetryDecision::Defer(self.delay_for(attempt_count))
    }

    fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = attempt_count.max(1);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}
