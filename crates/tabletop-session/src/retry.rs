#![forbid(unsafe_code)]

//! Reconnect backoff.
//!
//! [`RetryPolicy`] computes deterministic delays (no jitter) so reconnect
//! timing is reproducible in tests. [`ReconnectSchedule`] applies a policy to
//! a clock that the session passes in explicitly.
//!
//! ```
//! use tabletop_session::retry::{BackoffStrategy, RetryPolicy};
//! use web_time::Duration;
//!
//! let policy = RetryPolicy::new(3, BackoffStrategy::Exponential {
//!     base_ms: 100,
//!     max_ms: 5000,
//! });
//!
//! assert_eq!(policy.delay(0), Duration::from_millis(100));
//! assert_eq!(policy.delay(1), Duration::from_millis(200));
//! assert_eq!(policy.delay(2), Duration::from_millis(400));
//! ```

use serde::{Deserialize, Serialize};
use web_time::{Duration, Instant};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^attempt`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
    /// `base_ms * (attempt + 1)`, capped at `max_ms`.
    Linear { base_ms: u64, max_ms: u64 },
}

/// Attempts and backoff for reconnecting a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which the failure is reported (retrying continues at the capped delay).
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            5,
            BackoffStrategy::Exponential {
                base_ms: 250,
                max_ms: 8_000,
            },
        )
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Retry immediately, forever.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::Fixed { delay_ms: 0 },
        }
    }

    /// Delay before the given attempt (0-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Exponential { base_ms, max_ms } => {
                let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                let delay = base_ms.saturating_mul(multiplier);
                Duration::from_millis(delay.min(*max_ms))
            }
            BackoffStrategy::Linear { base_ms, max_ms } => {
                let delay = base_ms.saturating_mul(u64::from(attempt) + 1);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }

    /// Sum of the delays of the first `max_retries` attempts.
    #[must_use]
    pub fn total_max_delay(&self) -> Duration {
        (0..self.max_retries).map(|i| self.delay(i)).sum()
    }

    pub(crate) fn validate(&self, prefix: &str, errors: &mut Vec<String>) {
        match self.backoff {
            BackoffStrategy::Exponential { base_ms, max_ms }
            | BackoffStrategy::Linear { base_ms, max_ms } => {
                if base_ms > max_ms {
                    errors.push(format!(
                        "{prefix}.backoff.base_ms ({base_ms}) must be <= max_ms ({max_ms})"
                    ));
                }
            }
            BackoffStrategy::Fixed { .. } => {}
        }
    }
}

/// Reconnect bookkeeping against an explicit clock.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    policy: RetryPolicy,
    attempt: u32,
    next_at: Option<Instant>,
    exhausted_reported: bool,
}

impl ReconnectSchedule {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            next_at: None,
            exhausted_reported: false,
        }
    }

    /// Arm the schedule after a disconnect observed at `now`.
    pub fn start(&mut self, now: Instant) {
        if self.next_at.is_none() {
            self.next_at = Some(now + self.policy.delay(self.attempt));
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.next_at.is_some()
    }

    /// Whether an attempt is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_at.is_some_and(|at| now >= at)
    }

    /// Record a failed attempt made at `now` and schedule the next one.
    ///
    /// Returns `true` exactly once, when the attempt count first reaches
    /// `max_retries`.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.attempt = self.attempt.saturating_add(1);
        self.next_at = Some(now + self.policy.delay(self.attempt));
        if !self.exhausted_reported && self.attempt >= self.policy.max_retries {
            self.exhausted_reported = true;
            return true;
        }
        false
    }

    /// Attempts made since the last success.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget the outage after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_at = None;
        self.exhausted_reported = false;
    }
}
