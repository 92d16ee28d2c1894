//! Retry engine — exponential backoff with jitter around an idempotent
//! attempt, honoring upstream `Retry-After` requests.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{Result, UpstreamError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Additive jitter of 0–50% on each delay.
    pub jitter: bool,
    /// Hard budget across all attempts.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryConfig {
    /// Backoff for a 1-based attempt number, before jitter.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.as_millis() as f64 * self.factor.powi(exp as i32);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Run `f` until it succeeds, the error is non-retryable, attempts are
/// exhausted, or the overall timeout elapses. A `Retry-After` carried on a
/// rate-limit error raises the next delay for this retry instance only.
pub async fn retry_with<F, Fut, T>(config: &RetryConfig, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();

    for attempt in 1..=config.max_attempts {
        let result = match config.timeout {
            Some(budget) => {
                let remaining = budget.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(UpstreamError::Timeout {
                        ms: budget.as_millis() as u64,
                    });
                }
                match tokio::time::timeout(remaining, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout {
                        ms: budget.as_millis() as u64,
                    }),
                }
            }
            None => f().await,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt == config.max_attempts {
            return Err(err);
        }

        let mut delay = config.backoff_for_attempt(attempt);
        if let UpstreamError::RateLimited {
            retry_after: Some(requested),
            ..
        } = &err
        {
            delay = delay.max(*requested);
        }
        if config.jitter {
            let extra = rand::rng().random_range(0.0..=0.5);
            delay += Duration::from_millis((delay.as_millis() as f64 * extra) as u64);
        }

        warn!(
            op,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying upstream call"
        );
        tokio::time::sleep(delay).await;
    }

    // The loop always returns from inside; attempts >= 1 is enforced above.
    Err(UpstreamError::Timeout { ms: 0 })
}

/// Parse a `Retry-After` header value — either delay-seconds or an
/// HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            factor: 2.0,
            jitter: false,
            timeout: None,
        }
    }

    fn retryable() -> UpstreamError {
        UpstreamError::Api {
            status: 503,
            error_type: "overloaded_error".into(),
            message: "busy".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = retry_with(&quick(), "test", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(retryable())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<()> = retry_with(&quick(), "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Api {
                    status: 400,
                    error_type: "invalid_request_error".into(),
                    message: "bad".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_attempt_error_surfaces() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<()> = retry_with(&quick(), "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(retryable())
            }
        })
        .await;
        assert!(matches!(result, Err(UpstreamError::Api { status: 503, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_after_raises_the_next_delay() {
        let config = quick();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let started = Instant::now();
        let result = retry_with(&config, "test", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(UpstreamError::RateLimited {
                        status: 429,
                        retry_after: Some(Duration::from_millis(80)),
                        message: "slow down".into(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        // The requested 80ms dominates the 5ms base delay.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn overall_timeout_cuts_off_attempts() {
        let config = RetryConfig {
            timeout: Some(Duration::from_millis(30)),
            ..quick()
        };
        let result: Result<()> = retry_with(&config, "test", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(UpstreamError::Timeout { .. })));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            ..quick()
        };
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn parse_retry_after_seconds_and_date() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        let future = (chrono::Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed >= Duration::from_secs(25));
        assert!(parse_retry_after("garbage").is_none());
    }
}
