//! Retries for planning I/O.
//!
//! Statistics, sampling, shard metadata and schema capture all talk to the
//! source and may fail transiently. The planner runs each of those calls
//! through [`retry_with_backoff`] under a [`RetryPolicy`] derived from
//! [`SplitConfig`](crate::config::SplitConfig). Only errors for which
//! [`SplitError::is_retriable`] holds are retried.

use crate::error::{Result, SplitError};
use crate::schema::CollectionId;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Fraction of each backoff delay that is randomized.
pub const DEFAULT_JITTER: f64 = 0.2;

/// How often, and how patiently, a planning call is retried.
///
/// ```rust
/// use rivven_snapshot::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
///
/// assert!(policy.allows(2));
/// assert!(!policy.allows(3));
/// assert_eq!(policy.backoff(1), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
            .with_jitter(DEFAULT_JITTER)
    }
}

impl RetryPolicy {
    /// Policy without jitter. `max_delay` is raised to `base_delay` if lower.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: 0.0,
        }
    }

    /// Fail on the first error.
    pub fn no_retries() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Randomize each delay by up to `fraction` of itself in either direction.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether another retry may follow `retries_done` retries.
    pub fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Delay before retry number `retry` (zero-based), doubling from the base
    /// delay up to the cap, then jittered.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }
}

/// Run a planning call for `collection`, retrying transient failures.
///
/// Permanent errors come back unchanged on the first failure. A transient
/// error that outlasts the policy becomes [`SplitError::PlanningFailed`]
/// with the number of attempts made.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    collection: &CollectionId,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0u32;
    let error = loop {
        let error = match call().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(collection = %collection, operation, retries, "Planning call recovered");
                }
                return Ok(value);
            }
            Err(e) if e.is_retriable() => e,
            Err(e) => return Err(e),
        };
        if !policy.allows(retries) {
            break error;
        }

        let delay = policy.backoff(retries);
        retries += 1;
        warn!(
            collection = %collection,
            operation,
            retry = retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Planning call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    };

    Err(SplitError::planning_failed(
        collection,
        retries + 1,
        format!("{}: {}", operation, error),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn orders() -> CollectionId {
        CollectionId::new("shop", "orders")
    }

    fn quick(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 5);
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn test_disabled() {
        assert!(!RetryPolicy::no_retries().allows(0));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jittered_backoff_bounds() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.5);

        for _ in 0..50 {
            let ms = policy.backoff(1).as_secs_f64() * 1000.0;
            assert!((100.0 - 1e-6..=300.0 + 1e-6).contains(&ms), "{}", ms);
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_with_backoff(&quick(3), &orders(), "stats", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SplitError::ConnectionClosed)
            } else {
                Ok("stats")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "stats");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_planning_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff(&quick(2), &orders(), "stats", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SplitError::timeout("catalog"))
        })
        .await;

        match result {
            Err(SplitError::PlanningFailed {
                collection,
                attempts,
                reason,
            }) => {
                assert_eq!(collection, "shop.orders");
                assert_eq!(attempts, 3);
                assert!(reason.starts_with("stats:"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff(&quick(5), &orders(), "schema", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SplitError::schema("collection dropped"))
        })
        .await;

        assert!(matches!(result, Err(SplitError::Schema(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
