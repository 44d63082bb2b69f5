//! Startup helpers for processes embedding courier.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Connection attempts made by [`connect_with_retry`] before giving up.
pub const CONNECT_MAX_ATTEMPTS: usize = 30;

/// Initialize tracing from the `COURIER_LOG` environment variable.
///
/// Defaults to "info" when the variable is unset or unparsable. Safe to call
/// more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Connect to a broker with exponential backoff.
///
/// `target` is only used for logging. Returns the last error once
/// [`CONNECT_MAX_ATTEMPTS`] attempts have failed.
pub async fn connect_with_retry<T, E, F, Fut>(target: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(CONNECT_MAX_ATTEMPTS - 1);

    let result = connect
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .notify(|e: &E, delay: Duration| {
            warn!(broker = %target, error = %e, delay = ?delay, "Connection failed, retrying");
        })
        .await;

    match &result {
        Ok(_) => info!(broker = %target, "Connected"),
        Err(e) => error!(
            broker = %target,
            attempts = CONNECT_MAX_ATTEMPTS,
            error = %e,
            "Giving up on connection"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_succeeds_after_failures() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result: Result<&str, String> = connect_with_retry("broker", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("connection refused".to_string())
            } else {
                Ok("connected")
            }
        })
        .await;

        assert_eq!(result, Ok("connected"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_gives_up() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result: Result<(), String> = connect_with_retry("broker", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("connection refused".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), CONNECT_MAX_ATTEMPTS);
    }
}
