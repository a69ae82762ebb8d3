//! Retry policy: how many failed attempts a job gets and how long to wait
//! before re-dispatching it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry ceiling stamped onto newly created jobs
    pub max_retries: u32,
    /// Base delay before re-dispatch (zero = re-publish immediately)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

/// What to do with a job whose execution attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Record PENDING with the new count, wait `delay`, then re-publish.
    Retry { retry_count: u32, delay: Duration },
    /// Record FAILED with the new count. Terminal.
    GiveUp { retry_count: u32 },
}

impl RetryDecision {
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryDecision::Retry { retry_count, .. } | RetryDecision::GiveUp { retry_count } => {
                *retry_count
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryDecision::GiveUp { .. })
    }
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before re-dispatching after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Decide the outcome of a failed attempt.
    ///
    /// `retry_count` is the value read from the store *before* this failure;
    /// `max_retries` is the job's own ceiling. The job is given up once the
    /// incremented count reaches the ceiling, so at most `max_retries`
    /// attempts ever run.
    ///
    /// The recorded count never passes the ceiling, nor drops below the
    /// stored count: a row whose ceiling is zero gives up at zero.
    pub fn decide(&self, retry_count: u32, max_retries: u32) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next >= max_retries {
            RetryDecision::GiveUp {
                retry_count: next.min(max_retries.max(retry_count)),
            }
        } else {
            RetryDecision::Retry {
                retry_count: next,
                delay: self.delay_for_attempt(next),
            }
        }
    }
}
