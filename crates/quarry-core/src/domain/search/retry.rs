//! Retry with exponential backoff for index writes

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Index writes always get at least one retry
const MIN_ATTEMPTS: u32 = 2;

/// How failed index writes are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(MIN_ATTEMPTS),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `write` until it succeeds or the attempts are used up
    ///
    /// Transient errors are retried; anything else fails straight away. Both
    /// end up as [`Error::IndexWriteFailed`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match write().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempts < self.attempts => {
                    let backoff = self.backoff(attempts);
                    tracing::warn!(
                        operation,
                        attempt = attempts,
                        wait_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Index write failed, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(Error::IndexWriteFailed {
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50), Duration::from_millis(150));
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(150));
        assert_eq!(policy.backoff(30), Duration::from_millis(150));
    }

    #[test]
    fn test_minimum_attempts() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.attempts(), 2);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let value = fast()
            .run("upsert", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::IndexUnavailable("locked".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("upsert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::IndexUnavailable("locked".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::IndexWriteFailed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("delete", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::InvalidInput("bad row".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::IndexWriteFailed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
