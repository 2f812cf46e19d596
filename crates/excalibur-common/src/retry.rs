//! Retry utilities with exponential backoff and jitter.
//!
//! Every external call the tunnel makes (signing authority, API server,
//! tunnel dial) can fail transiently. These helpers retry with exponential
//! backoff plus jitter and stop promptly when the shared cancellation token
//! fires.
//!
//! # Example
//!
//! ```ignore
//! use excalibur_common::retry::{retry_until_cancelled, RetryConfig};
//!
//! let name = retry_until_cancelled(
//!     &RetryConfig::default(),
//!     "submit signing request",
//!     &stop,
//!     || async { authority.submit(&request).await },
//! ).await;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Scale a delay by a random factor in 0.5x..1.5x
pub fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Execute an async operation with exponential backoff and jitter until it
/// succeeds or `stop` is cancelled.
///
/// Returns `None` if cancelled before the operation succeeded. An attempt
/// already in flight is allowed to finish before cancellation is observed.
pub async fn retry_until_cancelled<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    stop: &CancellationToken,
    mut operation: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        if stop.is_cancelled() {
            return None;
        }
        attempt += 1;

        match operation().await {
            Ok(result) => return Some(result),
            Err(e) => {
                let delay = jittered(config.delay_for(attempt));
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(operation = %operation_name, "Retry abandoned on shutdown");
                        return None;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Poll `check` every `interval` until it yields a value or `stop` fires.
///
/// The first check runs immediately. Errors from `check` are logged and
/// polling continues. Returns `None` only on cancellation.
pub async fn poll_until_ready<F, Fut, T, E>(
    description: &str,
    interval: Duration,
    stop: &CancellationToken,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: std::fmt::Display,
{
    loop {
        match check().await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => debug!("Waiting for {}", description),
            Err(e) => warn!(error = %e, "Poll error for {}, retrying...", description),
        }

        tokio::select! {
            _ = stop.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let stop = CancellationToken::new();
        let result =
            retry_until_cancelled(&fast_config(), "noop", &stop, || async { Ok::<_, String>(7) })
                .await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let stop = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_until_cancelled(&fast_config(), "flaky", &stop, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {} failed", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Some(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt_runs_nothing() {
        let stop = CancellationToken::new();
        stop.cancel();
        let attempts = AtomicU32::new(0);

        let result: Option<()> = retry_until_cancelled(&fast_config(), "skipped", &stop, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(350));
        assert_eq!(config.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_retry_until_cancelled_stops_on_shutdown() {
        let stop = CancellationToken::new();
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Option<()> =
            retry_until_cancelled(&fast_config(), "never", &stop, || async {
                Err::<(), _>("nope")
            })
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_poll_until_ready_returns_value() {
        let stop = CancellationToken::new();
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let value = poll_until_ready("value", Duration::from_millis(1), &stop, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err("not yet".to_string()),
                    1 => Ok(None),
                    _ => Ok(Some(n)),
                }
            }
        })
        .await;

        assert_eq!(value, Some(2));
    }

    #[tokio::test]
    async fn test_poll_until_ready_honours_cancellation() {
        let stop = CancellationToken::new();
        stop.cancel();
        let value: Option<u32> =
            poll_until_ready("nothing", Duration::from_secs(60), &stop, || async {
                Ok::<_, String>(None)
            })
            .await;
        assert!(value.is_none());
    }
}
