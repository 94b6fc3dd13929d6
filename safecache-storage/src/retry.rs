//! Retry combinator for store operations.
//!
//! ```text
//! attempt 0 ── ok ──────────────────────────────→ Completed(value)
//!     │
//!  timeout → sleep(base * 2^0) → attempt 1 ── ok → Completed(value)
//!                                    │
//!                                 timeout → ... → Exhausted
//!
//! any other error ──────────────────────────────→ Err(error)
//! ```
//!
//! The combinator only decides whether to try again. What happens after
//! exhaustion (recovering the store, choosing a fallback) belongs to the caller.

use safecache_core::{RetryPolicy, SafeCacheResult};

/// How a retried operation ended, when it did not fail hard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempted<T> {
    /// An attempt succeeded.
    Completed(T),
    /// Every attempt timed out.
    Exhausted { attempts: u32 },
}

impl<T> Attempted<T> {
    /// The successful value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Attempted::Completed(value) => Some(value),
            Attempted::Exhausted { .. } => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Attempted::Exhausted { .. })
    }
}

/// Run `op` up to `policy.retry_limit()` times.
///
/// `op` receives the zero-based attempt index. A timeout sleeps for
/// `policy.delay_for(attempt)` on the calling thread before the next attempt,
/// including after the final one. Any non-timeout error is returned at once.
pub fn with_retry<T, F>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> SafeCacheResult<Attempted<T>>
where
    F: FnMut(u32) -> SafeCacheResult<T>,
{
    let retry_limit = policy.retry_limit();
    for attempt in 0..retry_limit {
        match op(attempt) {
            Ok(value) => return Ok(Attempted::Completed(value)),
            Err(e) if e.is_timeout() => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    retry_limit,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "store operation timed out"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Attempted::Exhausted {
        attempts: retry_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use safecache_core::{SafeCacheError, StorageError};
    use std::time::{Duration, Instant};

    fn policy(retries: u32, base: Duration) -> RetryPolicy {
        RetryPolicy::from_configured_retries(retries, base).expect("policy should build")
    }

    fn timeout() -> SafeCacheError {
        StorageError::timeout("test", "simulated").into()
    }

    #[test]
    fn test_success_returns_immediately() {
        let mut calls = 0;
        let outcome = with_retry(&policy(5, Duration::ZERO), "get", |_| {
            calls += 1;
            Ok::<_, SafeCacheError>(42)
        })
        .expect("should not fail");
        assert_eq!(outcome, Attempted::Completed(42));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_timeout_then_success() {
        let mut seen = Vec::new();
        let outcome = with_retry(&policy(4, Duration::ZERO), "set", |attempt| {
            seen.push(attempt);
            if attempt < 2 {
                Err(timeout())
            } else {
                Ok(true)
            }
        })
        .expect("should not fail");
        assert_eq!(outcome, Attempted::Completed(true));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_exhaustion_uses_whole_budget() {
        let mut calls = 0;
        let outcome = with_retry(&policy(3, Duration::ZERO), "delete", |_| {
            calls += 1;
            Err::<bool, _>(timeout())
        })
        .expect("exhaustion is not an error");
        assert_eq!(outcome, Attempted::Exhausted { attempts: 2 });
        assert!(outcome.is_exhausted());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_other_errors_propagate_without_retry() {
        let mut calls = 0;
        let err = with_retry(&policy(5, Duration::ZERO), "get", |_| {
            calls += 1;
            Err::<(), _>(SafeCacheError::from(StorageError::Corrupted {
                reason: "bad page".to_string(),
            }))
        })
        .expect_err("corruption should propagate");
        assert!(matches!(err, SafeCacheError::Storage(StorageError::Corrupted { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_sleeps_between_attempts() {
        // 5ms + 10ms
        let started = Instant::now();
        let outcome = with_retry(&policy(3, Duration::from_millis(5)), "get", |_| {
            Err::<(), _>(timeout())
        })
        .expect("exhaustion is not an error");
        assert!(outcome.is_exhausted());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_completed_accessor() {
        assert_eq!(Attempted::Completed(7).completed(), Some(7));
        assert_eq!(Attempted::<i32>::Exhausted { attempts: 1 }.completed(), None);
    }
}
