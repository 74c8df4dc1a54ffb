//! Generic retry-with-timeout combinator.
//!
//! Wraps any fallible async operation with a bounded attempt count, a
//! per-attempt timeout, and a fixed wait between attempts. Each attempt
//! is a fresh invocation of the operation factory, never a resume, so
//! the wrapped operation must be idempotent across repeated invocations.
//! The inter-attempt sleep is local to the calling task and never delays
//! unrelated work.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CiError, Result};

/// Bounded retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Fixed wait between attempts.
    pub wait: Duration,

    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            wait: Duration::from_secs(30),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting, for tests and fast-fail contexts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            wait: Duration::ZERO,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Result of a retried operation together with the attempts consumed.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result: the first success, or the last attempt's error.
    pub result: Result<T>,

    /// Attempts actually made (1-based).
    pub attempts: u32,
}

/// Run `op` under `policy`.
///
/// `op` is called once per attempt with the 1-based attempt number and
/// must build a fresh future each time (clean environment, no state
/// carried over). A timed-out attempt counts as a failure. On
/// exhaustion the last error is surfaced.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    debug_assert!(policy.max_attempts >= 1);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(CiError::Timeout(policy.timeout)),
        };

        match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if attempt < max_attempts => {
                warn!(attempt, error = %err, "attempt failed, retrying");
                tokio::time::sleep(policy.wait).await;
            }
            Err(err) => {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let outcome = retry(&RetryPolicy::immediate(2), |_| async { Ok(42) }).await;
        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_fail_once_then_succeed() {
        let calls = AtomicU32::new(0);
        let outcome = retry(&RetryPolicy::immediate(2), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    Err(CiError::Store("transient".to_string()))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), "recovered");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let outcome = retry(&RetryPolicy::immediate(3), |attempt| async move {
            Err::<(), _>(CiError::Store(format!("attempt {attempt}")))
        })
        .await;

        assert_eq!(outcome.attempts, 3);
        let err = outcome.result.unwrap_err();
        assert!(err.to_string().contains("attempt 3"), "last error wins");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let policy = RetryPolicy {
            max_attempts: 2,
            wait: Duration::ZERO,
            timeout: Duration::from_millis(10),
        };
        let calls = AtomicU32::new(0);
        let outcome = retry(&policy, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    // First attempt hangs past the timeout.
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok("second attempt finishes")
            }
        })
        .await;

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn test_all_attempts_time_out() {
        let policy = RetryPolicy {
            max_attempts: 2,
            wait: Duration::ZERO,
            timeout: Duration::from_millis(5),
        };
        let outcome = retry(&policy, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.result, Err(CiError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_applies_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            wait: Duration::from_millis(50),
            timeout: Duration::from_secs(300),
        };
        let start = std::time::Instant::now();
        let outcome = retry(&policy, |attempt| async move {
            if attempt == 1 {
                Err(CiError::Store("flaky".to_string()))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(outcome.result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
