//! Exponential backoff with jitter for transient transport failures.

use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

/// How many times, and how patiently, a transient failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound of any delay.
    pub max: Duration,
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether `attempt` (1-based) may be followed by another one after failing with `err`.
    /// Permanent failures are never retried.
    pub fn should_retry(&self, attempt: u32, err: &TransportError) -> bool {
        err.is_transient() && attempt <= self.max_retries
    }

    /// Delay before retrying after `attempt` (1-based): `base * 2^(attempt-1)` capped at `max`,
    /// of which the upper half is randomised.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ceiling = self.base.saturating_mul(1u32 << exp).min(self.max);
        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        half + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base: Duration::from_millis(50),
            max: Duration::from_secs(1),
        }
    }
}
