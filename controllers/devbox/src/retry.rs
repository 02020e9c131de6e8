//! Bounded read-modify-write retry on optimistic-concurrency conflicts.
//!
//! Status and metadata writes re-fetch the latest object, reapply their
//! change and try again when the store reports a stale resourceVersion.
//! Any other error is returned immediately.

use crate::error::ControllerError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for conflict retries
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or
/// `max_attempts` is exhausted. The closure must re-read whatever it writes.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && attempt < config.max_attempts => {
                // Jitter: 1.0x to 1.1x of the delay
                let jitter = rand::thread_rng().gen_range(1.0..1.1);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = jittered.as_millis(),
                    "Write conflict, retrying with latest version"
                );
                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
                );
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        "Giving up after repeated write conflicts"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::ClusterError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> ControllerError {
        ControllerError::Cluster(ClusterError::Conflict("stale".to_string()))
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_on_conflict(&RetryConfig::default(), "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry_on_conflict(&RetryConfig::default(), "test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry_on_conflict(&RetryConfig::default(), "test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ControllerError::RuntimeNotFound("go".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ControllerError::RuntimeNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
