use std::fmt::{Debug, Display};

use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 3.0;

pub async fn exponential_backoff(
    n: u32,
    base_increment: f64,
    max_seconds: f64,
    cancel: &CancellationToken,
) {
    let backoff_duration_seconds =
        exponential_backoff_duration_seconds(n, base_increment, max_seconds);
    if backoff_duration_seconds > 0.0 {
        tracing::info!(
            "Backoff: waiting {backoff_duration_seconds} seconds before processing with the task",
        );

        drop(
            tokio::time::timeout(
                std::time::Duration::from_secs_f64(backoff_duration_seconds),
                cancel.cancelled(),
            )
            .await,
        )
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_increment: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (base_increment * 2.0_f64.powf(f64::from(n - 1))).min(max_seconds)
    }
}

/// Retries passed operation until one of the following conditions are met:
/// - encountered error is considered as permanent (non-retryable)
/// - retries have been exhausted
/// - cancellation token has been cancelled
///
/// `is_permanent` closure should be used to provide distinction between
/// permanent and non-permanent errors. When attempts cross `warn_threshold`,
/// the error is logged with a warning.
///
/// Returns `None` if cancellation was noticed during backoff or the callback
/// was cancelled.
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_retries: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    // Not std::error::Error because anyhow::Error doesnt implement it.
    // For context see https://github.com/dtolnay/anyhow/issues/63
    E: Display + Debug + 'static,
    O: FnMut() -> F,
    F: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = op() => result,
        };

        match result {
            Ok(_) => {
                if attempts > 0 {
                    tracing::info!("{description} succeeded after {attempts} retries");
                }
                return Some(result);
            }

            // These are "permanent" errors that should not be retried.
            Err(ref e) if is_permanent(e) => {
                return Some(result);
            }
            // Assume that any other failure might be transient, and the operation might
            // succeed if we just keep trying.
            Err(err) if attempts < warn_threshold => {
                tracing::info!("{description} failed, will retry (attempt {attempts}): {err:#}");
            }
            Err(err) if attempts < max_retries => {
                tracing::warn!("{description} failed, will retry (attempt {attempts}): {err:#}");
            }
            Err(ref err) => {
                // Operation failed `max_attempts` times. Time to give up.
                tracing::warn!(
                    "{description} still failed after {attempts} retries, giving up: {err:?}"
                );
                return Some(result);
            }
        }
        // sleep and retry
        exponential_backoff(
            attempts,
            DEFAULT_BASE_BACKOFF_SECONDS,
            DEFAULT_MAX_BACKOFF_SECONDS,
            cancel,
        )
        .await;
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::sync::Mutex;

    #[test]
    fn backoff_durations_grow_and_cap() {
        assert_eq!(exponential_backoff_duration_seconds(0, 1.0, 4.0), 0.0);
        assert_eq!(exponential_backoff_duration_seconds(1, 1.0, 4.0), 1.0);
        assert_eq!(exponential_backoff_duration_seconds(2, 1.0, 4.0), 2.0);
        assert_eq!(exponential_backoff_duration_seconds(3, 1.0, 4.0), 4.0);
        assert_eq!(exponential_backoff_duration_seconds(10, 1.0, 4.0), 4.0);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let attempts = Mutex::new(0u32);
        let cancel = CancellationToken::new();
        let result = retry(
            || async {
                *attempts.lock().await += 1;
                Err::<(), io::Error>(io::Error::new(io::ErrorKind::InvalidInput, "nope"))
            },
            |e| e.kind() == io::ErrorKind::InvalidInput,
            1,
            10,
            "test operation",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Err(_))));
        assert_eq!(*attempts.lock().await, 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let attempts = Mutex::new(0u32);
        let cancel = CancellationToken::new();
        let result = retry(
            || async {
                *attempts.lock().await += 1;
                Err::<(), io::Error>(io::Error::new(io::ErrorKind::Other, "transient"))
            },
            |_| false,
            1,
            2,
            "test operation",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Err(_))));
        assert_eq!(*attempts.lock().await, 3);
    }

    #[tokio::test]
    async fn retry_returns_none_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = retry(
            || async { Ok::<_, io::Error>(()) },
            |_| false,
            1,
            2,
            "test operation",
            &cancel,
        )
        .await;
        assert!(result.is_none());
    }
}
