use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Retry behavior as plain data, shared by every provider client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `min(cap, 2^attempt + uniform(0,1))` seconds, attempt 0-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = 2f64.powi(attempt.min(16) as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64((base + jitter).min(self.max_backoff.as_secs_f64()))
    }
}

/// Terminal outcome of a retried operation: how many attempts ran and
/// the error that ended them.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub last_error: Error,
}

impl RetryFailure {
    pub fn into_error(self) -> Error {
        self.last_error
    }
}

/// Drives `op` until it succeeds, fails terminally, or the attempt
/// budget runs out. Only errors whose `is_retryable()` is true are
/// retried; the backoff sleep runs between attempts.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> std::result::Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let budget = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() || attempt >= budget {
                    return Err(RetryFailure {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                let delay = policy.backoff(attempt - 1);
                tracing::warn!(
                    "Attempt {}/{} failed ({}), retrying in {:.1}s",
                    attempt,
                    budget,
                    err,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout_error() -> Error {
        Error::Timeout {
            model: "openai/gpt-4".to_string(),
            seconds: 360.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        let first = policy.backoff(0).as_secs_f64();
        assert!((1.0..2.0).contains(&first));
        let second = policy.backoff(1).as_secs_f64();
        assert!((2.0..3.0).contains(&second));
        let huge = policy.backoff(10).as_secs_f64();
        assert!(huge <= 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeouts_yield_exactly_three_attempts() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = with_retries(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(timeout_error()) }
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failure.attempts, 3);
        assert!(
            matches!(failure.last_error, Error::Timeout { seconds, .. } if seconds == 360.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = with_retries(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::Api {
                    provider: "openrouter".to_string(),
                    model: "openai/gpt-4".to_string(),
                    message: "HTTP 400".to_string(),
                })
            }
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = with_retries(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(timeout_error())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
