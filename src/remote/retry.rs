//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// Retry policy for remote calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl RetryConfig {
    /// Delay before the given attempt (0-indexed; attempt 0 never waits).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter && capped > 0.0 {
            let extra = capped * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(capped + extra)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` is invoked afresh for each attempt so callers can re-sign.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `op`.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    tracing::warn!(
                        call = label,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Remote call failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_then_caps() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::default();
        for _ in 0..50 {
            let d = config.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast(3)
            .run("test", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::Status { status: 503, body: String::new() })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast(5)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Auth { status: 401, body: String::new() })
            })
            .await;

        assert!(matches!(result, Err(Error::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = fast(3)
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
