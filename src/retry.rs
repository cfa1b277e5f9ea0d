//! Generic retry execution with linear backoff
//!
//! Publish and request call sites share this single wrapper. The backoff is
//! linear: after the k-th failed attempt the executor sleeps `k` backoff
//! units before attempting again. Attempts are strictly sequential so the
//! delays stay meaningful.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy: maximum attempt count plus the backoff time unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts. Values of zero or one both mean a single
    /// attempt with no retry.
    pub max_attempts: u32,
    /// Linear backoff unit: the sleep before attempt `k + 1` is `k` units.
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    /// Policy with the given attempt budget and the one-second default unit.
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Override the backoff unit.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Backoff delay after `failed_attempts` consecutive failures.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        self.backoff_unit * failed_attempts
    }

    fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` under `policy`, returning the number of failed attempts
/// consumed alongside the final result.
///
/// An operation succeeding on attempt `k` reports `k - 1`; an operation that
/// never succeeds is attempted exactly `max(max_attempts, 1)` times and
/// reports that count with the last error.
pub async fn with_retries<T, E, Fut, Op>(policy: &RetryPolicy, mut operation: Op) -> (u32, Result<T, E>)
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let budget = policy.attempt_budget();
    let mut failures = 0u32;
    loop {
        match operation().await {
            Ok(value) => return (failures, Ok(value)),
            Err(err) => {
                failures += 1;
                if failures >= budget {
                    return (failures, Err(err));
                }
                let delay = policy.delay_after(failures);
                debug!(attempt = failures, ?delay, "operation failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_backoff_unit(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_consumes_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let (attempts, result) = with_retries::<(), _, _, _>(&fast_policy(5), || {
            let calls = calls_in_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), &str>("transport down")
            }
        })
        .await;

        assert_eq!(attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(result, Err("transport down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_later_attempt_reports_prior_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let (attempts, result) = with_retries(&fast_policy(5), || {
            let calls = calls_in_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transport down")
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

        assert_eq!(attempts, 2);
        assert_eq!(result, Ok(7));
        // No further attempts once the operation succeeded.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_reports_zero() {
        let (attempts, result) = with_retries(&fast_policy(3), || async { Ok::<_, &str>(1u32) }).await;
        assert_eq!(attempts, 0);
        assert_eq!(result, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_and_one_attempt_budgets_mean_single_attempt() {
        for max_attempts in [0u32, 1] {
            let calls = Arc::new(AtomicU32::new(0));
            let calls_in_op = calls.clone();
            let (attempts, result) = with_retries::<(), _, _, _>(&fast_policy(max_attempts), || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), &str>("nope")
                }
            })
            .await;

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(attempts, 1);
            assert!(result.is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_timing() {
        // n failing attempts sleep 1 + 2 + ... + (n-1) units in total.
        let unit = Duration::from_millis(100);
        let policy = RetryPolicy::new(4).with_backoff_unit(unit);

        let start = Instant::now();
        let (attempts, result) =
            with_retries::<(), _, _, _>(&policy, || async { Err::<(), &str>("down") }).await;

        assert_eq!(attempts, 4);
        assert!(result.is_err());
        assert_eq!(start.elapsed(), unit * (1 + 2 + 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_after_is_linear_not_exponential() {
        let policy = RetryPolicy::new(10).with_backoff_unit(Duration::from_secs(1));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
        assert_eq!(policy.delay_after(7), Duration::from_secs(7));
    }

    #[test]
    fn test_attempt_accounting_sweep() {
        use proptest::prelude::*;

        proptest!(|(max_attempts in 1u32..8, succeed_at in 1u32..10)| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let (attempts, result) = runtime.block_on(async {
                let calls = Arc::new(AtomicU32::new(0));
                let calls_in_op = calls.clone();
                with_retries(&fast_policy(max_attempts), || {
                    let calls = calls_in_op.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) + 1 >= succeed_at {
                            Ok(())
                        } else {
                            Err("down")
                        }
                    }
                })
                .await
            });

            if succeed_at <= max_attempts {
                // Succeeds on attempt `succeed_at`, reporting the failures before it.
                prop_assert_eq!(attempts, succeed_at - 1);
                prop_assert!(result.is_ok());
            } else {
                prop_assert_eq!(attempts, max_attempts);
                prop_assert!(result.is_err());
            }
        });
    }
}
