//! Retry policy with exponential backoff.
//!
//! The same policy drives task re-dispatch in the scheduler and artifact
//! store I/O during assembly.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use vgen_models::FailureClass;

use crate::metrics;

/// Retry limits and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries (not including the initial attempt)
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubles each attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Upper bound on dispatches of one task.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide after `attempts` dispatches have been made and the last one
    /// failed with `class`.
    pub fn decide(&self, attempts: u32, class: FailureClass) -> RetryDecision {
        if class.is_retryable() && attempts < self.max_attempts() {
            RetryDecision::RetryAfter(self.delay_for_attempt(attempts))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Execute an async operation, retrying errors accepted by `should_retry`.
///
/// # Example
/// ```ignore
/// let bytes = retry_async(&policy, "fetch_clip", StorageError::is_retryable, || async {
///     store.get(&artifact).await
/// })
/// .await?;
/// ```
pub async fn retry_async<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && attempt < policy.max_attempts() => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    "{} attempt {} failed, retrying in {:?}: {}",
                    operation_name, attempt, delay, e
                );
                metrics::record_io_retry(operation_name);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("{} failed after {} attempts: {}", operation_name, attempt, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_decide_allows_r_retries() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(
            policy.decide(1, FailureClass::Transient),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(3, FailureClass::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(policy.decide(4, FailureClass::Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_never_retries_permanent() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1, FailureClass::Permanent), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1, FailureClass::Upstream), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.decide(1, FailureClass::Transient), RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_eventual_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = retry_async(&policy, "test", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_stops_on_non_retryable() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_async(
            &policy,
            "test",
            |e: &String| e != "fatal",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
