use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetrySection;
use crate::error::{SyncError, UpstreamError};

/// Bounded exponential backoff around one fallible operation.
///
/// Only errors for which [`SyncError::is_transient`] holds are retried;
/// anything else is returned on the first failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            multiplier: section.multiplier.max(1),
            max_delay: Duration::from_millis(section.max_delay_ms),
        }
    }

    /// A policy that never waits; used where a single attempt is wanted.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            multiplier: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op`, retrying transient failures until the attempt ceiling.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> crate::error::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = op_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let mut delay = self.delay_for(attempt);
                    if let SyncError::Upstream(UpstreamError::RateLimited {
                        retry_after_secs: Some(secs),
                    }) = &e
                    {
                        delay = delay.max(Duration::from_secs(*secs));
                    }
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::StoreError;

    fn transient() -> SyncError {
        UpstreamError::Network("connection reset".into()).into()
    }

    #[test]
    fn default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = RetryPolicy::default()
            .run("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ceiling() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run::<(), _, _>("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run::<(), _, _>("upsert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Malformed("no key".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Malformed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let _ = RetryPolicy::default()
            .run::<(), _, _>("upsert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NodeNotFound("x".into()).into())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn honours_retry_after() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        RetryPolicy::default()
            .run("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(UpstreamError::RateLimited {
                        retry_after_secs: Some(30),
                    }
                    .into())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn no_retry_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = RetryPolicy::no_retry()
            .run::<(), _, _>("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
