//! Bounded retry and polling utilities
//!
//! Startup preconditions (the orchestrator's kubeconfig appearing, the first
//! successful API contact) are waited on with an overall deadline rather than
//! polled forever; exceeding the deadline is a fatal startup error. Transient
//! faults inside the running system retry with exponential backoff and jitter.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Configuration for retrying a transiently failing operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap applied to the growing delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds, sleeping with exponential backoff and
/// jitter between attempts. Returns the last error once `max_attempts` is
/// exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;

    for attempt in 1.. {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= config.max_attempts => return Err(e),
            Err(e) => {
                // Jitter between 0.5x and 1.5x keeps restarting nodes from
                // hammering the API server in lockstep
                let factor = rand::thread_rng().gen_range(0.5..1.5);
                let sleep = delay.mul_f64(factor);
                warn!(
                    operation = %what,
                    attempt,
                    error = %e,
                    retry_in_ms = sleep.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(sleep).await;
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }
    unreachable!("retry loop always returns")
}

/// Poll `probe` at a fixed interval until it yields a value, or fail with a
/// startup error once `deadline` has elapsed.
pub async fn poll_until<F, Fut, T>(
    what: &str,
    interval: Duration,
    deadline: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = probe().await {
            return Ok(value);
        }
        if start.elapsed() >= deadline {
            return Err(Error::startup(format!(
                "timed out after {:?} waiting for {}",
                deadline, what
            )));
        }
        debug!(waiting_for = %what, elapsed = ?start.elapsed(), "still waiting");
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let result: std::result::Result<i32, &str> =
            retry_with_backoff(&fast_config(3), "op", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: std::result::Result<&str, &str> =
            retry_with_backoff(&fast_config(5), "op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err("not yet")
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: std::result::Result<(), &str> =
            retry_with_backoff(&fast_config(3), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("broken")
                }
            })
            .await;

        assert_eq!(result, Err("broken"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_returns_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let value = poll_until(
            "thing",
            Duration::from_millis(1),
            Duration::from_secs(1),
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Some(42)
                    } else {
                        None
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn poll_until_deadline_is_fatal() {
        let err = poll_until(
            "never",
            Duration::from_millis(1),
            Duration::from_millis(10),
            || async { None::<()> },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Startup(_)));
        assert!(err.to_string().contains("never"));
    }
}
