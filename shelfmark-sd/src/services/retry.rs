//! Retried-call wrapper with exponential backoff and jitter
//!
//! Used around outbound provider calls. Retries only errors the caller
//! classifies as transient; everything else is returned immediately.
//! Exhausting the attempt budget surfaces the last error so batch loops
//! can count it and move on.

use rand::Rng;
use std::time::Duration;

/// Backoff tuning for [`with_retry`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Exponential growth factor
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Retry an async operation with exponential backoff and jitter.
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If `is_retryable(err)` and attempts remain: log WARN, backoff, retry
/// 4. Otherwise return the error immediately
///
/// Each delay is the exponential backoff plus up to 50% random jitter, so
/// concurrent callers hitting the same struggling provider do not retry in
/// lockstep.
pub async fn with_retry<F, Fut, T, E, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut backoff = policy.initial_backoff;
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }

                let jitter = {
                    let mut rng = rand::thread_rng();
                    backoff.mul_f64(rng.gen_range(0.0..0.5))
                };
                let delay = (backoff + jitter).min(policy.max_backoff);

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, will retry after backoff"
                );

                tokio::time::sleep(delay).await;
                backoff = backoff.mul_f64(policy.multiplier).min(policy.max_backoff);
            }
        }
    }

    unreachable!("retry loop always returns within max_attempts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let result: Result<i32, String> =
            with_retry("test_op", &fast_policy(), |_| true, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            "test_op",
            &fast_policy(),
            |_| true,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("connection reset".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            "test_op",
            &fast_policy(),
            |e: &String| e.contains("timeout"),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("bad request".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_surface_last_error() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            "test_op",
            &fast_policy(),
            |_| true,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(format!("timeout #{}", n)) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "timeout #3");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
