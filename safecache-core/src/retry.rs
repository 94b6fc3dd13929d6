//! Retry budget and exponential backoff schedule.

use crate::{ConfigError, MIN_CONFIGURED_RETRIES};
use std::time::Duration;

/// How many extra attempts an operation gets and how long to wait between them.
///
/// The store already retries once on its own, so a user-facing retry count of
/// `n` becomes a budget of `n - 1` attempts here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_limit: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    /// Build a policy from the user-facing retry count.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `retries` is below two.
    pub fn from_configured_retries(
        retries: u32,
        backoff_base: Duration,
    ) -> Result<Self, ConfigError> {
        if retries < MIN_CONFIGURED_RETRIES {
            return Err(ConfigError::InvalidValue {
                field: "retries".to_string(),
                value: retries.to_string(),
                reason: "the minimum number of retries is two".to_string(),
            });
        }
        Ok(Self {
            retry_limit: retries - 1,
            backoff_base,
        })
    }

    /// Number of attempts the wrapper makes before giving up.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Base delay, doubled on every attempt.
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    /// Delay to sleep after attempt `attempt` (zero-based) timed out.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let Some(factor) = 2u32.checked_pow(attempt) else {
            return Duration::MAX;
        };
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }

    /// Worst-case time spent sleeping before the operation falls back.
    pub fn max_total_backoff(&self) -> Duration {
        (0..self.retry_limit).fold(Duration::ZERO, |total, attempt| {
            total.saturating_add(self.delay_for(attempt))
        })
    }
}
