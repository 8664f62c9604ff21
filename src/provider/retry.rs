//! Bounded exponential backoff for transient provider failures.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Retry policy for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Non-transient failures and the failure of the last attempt are
    /// returned as-is.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt - 1);
                    tracing::warn!(
                        provider = %e.provider,
                        operation = %e.operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e.message,
                        "transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 4,
        }
    }

    fn failure(kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new("fake", "start", kind, "boom")
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_secs(1));
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
        assert_eq!(p.delay(3), Duration::from_secs(5));
        assert_eq!(p.delay(60), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_below_ceiling_succeed() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = tokio::time::Instant::now();

        let result = policy()
            .run(|| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(failure(ProviderErrorKind::Transient))
                } else {
                    Ok("running")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "running");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy()
            .run(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(failure(ProviderErrorKind::Transient))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy()
            .run(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(failure(ProviderErrorKind::Fatal))
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ProviderErrorKind::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
