//! Bounded retry with exponential backoff.
//!
//! Only two kinds of operation are retried: reads, on timeout, and
//! redemptions, on a lost conditional write. A redemption re-runs from the
//! key lookup, so a retry after someone else consumed the key resolves to
//! the deterministic "already used" error instead of a second grant.

use std::future::Future;
use std::time::Duration;

use crate::store::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay before attempt `attempt + 1` (zero-based `attempt`).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(10))
    }

    /// Sleep before the next attempt, or report that attempts are exhausted.
    pub async fn pause(&self, attempt: u32) -> bool {
        if attempt + 1 >= self.max_attempts {
            return false;
        }
        tokio::time::sleep(self.delay(attempt)).await;
        true
    }

    /// Run a read, retrying on [`StoreError::Timeout`].
    pub async fn read<T, F, Fut>(&self, operation: &str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(StoreError::Timeout) => {
                    tracing::warn!(%operation, attempt, "store read timed out");
                    if !self.pause(attempt).await {
                        return Err(StoreError::Timeout);
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10));
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn read_retries_timeouts_then_gives_up() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy
            .read("lookup", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Timeout) }
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn read_does_not_retry_conflicts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy
            .read("lookup", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Conflict) }
            })
            .await;
        assert!(matches!(result, Err(StoreError::Conflict)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_returns_first_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result = policy
            .read("lookup", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(StoreError::Timeout)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }
}
