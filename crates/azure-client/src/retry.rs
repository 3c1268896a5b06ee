//! Retry with exponential backoff for ARM requests.
//!
//! Transient failures (throttling, 5xx, connection errors) are retried a
//! bounded number of times. Anything else, and in particular "not found",
//! ends the retry loop immediately.

use crate::error::AzureError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts
pub const DEFAULT_BACKOFF_STEPS: u32 = 6;
/// Default growth factor between attempts
pub const DEFAULT_BACKOFF_EXPONENT: f64 = 1.5;
/// Default first delay
pub const DEFAULT_BACKOFF_DURATION: Duration = Duration::from_secs(5);
/// Default jitter factor
pub const DEFAULT_BACKOFF_JITTER: f64 = 1.0;

/// Backoff settings for cloud calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub steps: u32,
    /// Multiplier applied to the delay after each attempt
    pub exponent: f64,
    /// Delay before the second attempt
    pub duration: Duration,
    /// Adds up to `jitter * delay` of random extra wait
    pub jitter: f64,
    /// Upper bound for a single delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: DEFAULT_BACKOFF_STEPS,
            exponent: DEFAULT_BACKOFF_EXPONENT,
            duration: DEFAULT_BACKOFF_DURATION,
            jitter: DEFAULT_BACKOFF_JITTER,
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            steps: 1,
            ..Self::default()
        }
    }

    /// Start a fresh backoff sequence
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            remaining: self.steps.saturating_sub(1),
            current: self.duration,
            exponent: self.exponent,
            jitter: self.jitter,
            cap: self.cap,
        }
    }
}

/// Delay sequence produced by a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    remaining: u32,
    current: Duration,
    exponent: f64,
    jitter: f64,
    cap: Duration,
}

impl ExponentialBackoff {
    /// Next delay, or `None` once the step budget is spent
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.current.min(self.cap);
        let delay = apply_jitter(base, self.jitter).min(self.cap);

        let next = self.current.as_secs_f64() * self.exponent;
        self.current = Duration::from_secs_f64(next).min(self.cap);

        Some(delay)
    }
}

fn apply_jitter(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let secs = interval.as_secs_f64();
    let extra = rand::thread_rng().gen_range(0.0..=secs * jitter);
    Duration::from_secs_f64(secs + extra)
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or the
/// policy runs out of steps.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, AzureError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AzureError>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) if e.is_retriable() => match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        "{} failed (attempt {}), retrying in {:?}: {}",
                        operation_name, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!("{} failed after {} attempts: {}", operation_name, attempt, e);
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(steps: u32) -> RetryPolicy {
        RetryPolicy {
            steps,
            exponent: 2.0,
            duration: Duration::from_millis(1),
            jitter: 0.0,
            cap: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_backoff_grows_and_is_bounded_by_steps() {
        let mut backoff = fast_policy(4).backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(2)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(4)));
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = fast_policy(8).backoff();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_backoff()).collect();
        assert_eq!(delays.len(), 7);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(10)));
    }

    #[test]
    fn test_jitter_never_shrinks_delay() {
        let policy = RetryPolicy {
            jitter: 1.0,
            ..fast_policy(3)
        };
        let mut backoff = policy.backoff();
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(1));
        assert!(first <= Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&fast_policy(5), "get lb", || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AzureError::api(503, "ServiceUnavailable", "try later"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(5), "get vm", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AzureError::NotFound("vm".to_string()))
            }
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(3), "put lb", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AzureError::api(429, "TooManyRequests", "throttled"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(3), "put nsg", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AzureError::api(400, "InvalidRequestFormat", "bad"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
