//! Step, time and retry budgets for one controller run.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Return the remaining time budget until the provided deadline, or `None`
/// once it has elapsed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// How many times a failed model call is retried before the run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure (0 = no retry).
    pub max_retries: u32,
    /// Base delay between attempts; doubled after each failure.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-indexed).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(10);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Limits applied to a single controller run.
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Maximum number of model calls (each costs one step).
    pub max_steps: u32,
    pub retry: RetryPolicy,
    /// Optional wall-clock deadline checked at step boundaries.
    pub deadline: Option<Instant>,
}

impl RunLimits {
    pub fn new(max_steps: u32) -> Self {
        Self {
            max_steps,
            retry: RetryPolicy::default(),
            deadline: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| remaining_budget(deadline).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_ms: 100,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn elapsed_deadline_has_no_budget() {
        let past = Instant::now() - Duration::from_millis(5);
        assert!(remaining_budget(past).is_none());

        let limits = RunLimits {
            max_steps: 1,
            retry: RetryPolicy::default(),
            deadline: Some(past),
        };
        assert!(limits.deadline_passed());
        assert!(!RunLimits::new(1).deadline_passed());
    }
}
