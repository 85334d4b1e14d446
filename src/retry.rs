//! Retry with exponential backoff
//!
//! Listing pages and file downloads both go through [`with_backoff`]. Only
//! errors classified as transient by [`IsRetryable`] are retried; the delay
//! doubles (by default) after every attempt, capped at `max_delay`, with
//! optional jitter so parallel workers do not retry in lockstep.
//!
//! ```no_run
//! use index_mirror::config::RetryConfig;
//! use index_mirror::retry::{IsRetryable, with_backoff};
//!
//! #[derive(Debug)]
//! struct Flaky;
//!
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         f.write_str("flaky")
//!     }
//! }
//!
//! impl IsRetryable for Flaky {
//!     fn is_retryable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), Flaky> {
//! let value = with_backoff(&RetryConfig::default(), || async { Ok::<_, Flaky>(7) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error, ListingError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Classifies errors as transient (worth another attempt) or permanent
///
/// Timeouts, 5xx, 408/429, connection resets and truncated bodies are
/// transient. Auth rejections, 404, checksum mismatches and disk errors are not.
pub trait IsRetryable {
    /// Whether the operation should be attempted again
    fn is_retryable(&self) -> bool;
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network { transient, .. } => *transient,
            DownloadError::Status { status, .. } => is_transient_status(*status),
            // Short body: the connection dropped mid-stream
            DownloadError::SizeMismatch { .. } => true,
            DownloadError::HashMismatch { .. }
            | DownloadError::Io { .. }
            | DownloadError::PathCollision { .. }
            | DownloadError::Cancelled => false,
        }
    }
}

impl IsRetryable for ListingError {
    fn is_retryable(&self) -> bool {
        match self {
            ListingError::Unreachable { .. } => true,
            ListingError::Status { status, .. } => is_transient_status(*status),
            ListingError::AuthRejected { .. } | ListingError::Parse { .. } => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::Interrupted
            ),
            Error::Download(e) => e.is_retryable(),
            Error::Listing(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out
///
/// `config.max_attempts` counts retries: the operation runs at most
/// `max_attempts + 1` times. The last error is returned unchanged.
pub async fn with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut retries = 0;
    let mut delay = config.initial_delay;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!(attempts = retries + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::debug!(error = %error, "Permanent failure, not retrying");
            return Err(error);
        }
        if retries >= config.max_attempts {
            tracing::warn!(error = %error, attempts = retries + 1, "Giving up after retries");
            return Err(error);
        }

        retries += 1;
        let wait = if config.jitter { add_jitter(delay) } else { delay };
        tracing::warn!(
            error = %error,
            attempt = retries,
            max_attempts = config.max_attempts,
            delay_ms = wait.as_millis() as u64,
            "Transient failure, retrying"
        );
        tokio::time::sleep(wait).await;

        delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
            .min(config.max_delay);
    }
}

/// Stretch a delay by a random factor in `[1, 2]`
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0..=2.0);
    delay.mul_f64(factor)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for Outcome {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl IsRetryable for Outcome {
        fn is_retryable(&self) -> bool {
            *self == Outcome::Transient
        }
    }

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Runs an operation that fails `failures` times with `error`, then
    /// returns 42; reports the result and the number of calls
    async fn flaky(config: &RetryConfig, failures: u32, error: fn() -> Outcome) -> (Result<u32, Outcome>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_backoff(config, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn recovers_from_transient_failures() {
        assert_eq!(flaky(&quick(3), 0, || Outcome::Transient).await, (Ok(42), 1));
        assert_eq!(flaky(&quick(3), 2, || Outcome::Transient).await, (Ok(42), 3));
    }

    #[tokio::test]
    async fn stops_when_retries_run_out() {
        let (result, calls) = flaky(&quick(2), 10, || Outcome::Transient).await;
        assert_eq!(result, Err(Outcome::Transient));
        assert_eq!(calls, 3);

        let (_, calls) = flaky(&quick(0), 10, || Outcome::Transient).await;
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (result, calls) = flaky(&quick(5), 10, || Outcome::Permanent).await;
        assert_eq!(result, Err(Outcome::Permanent));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn delays_grow_and_are_capped() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(120),
            backoff_multiplier: 3.0,
            jitter: false,
        };
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let _ = with_backoff(&config, || {
            let stamps = stamps.clone();
            async move {
                stamps.lock().unwrap().push(Instant::now());
                Err::<(), _>(Outcome::Transient)
            }
        })
        .await;

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 5);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        // 40ms, then 120ms (capped) for every later retry
        assert!(gaps[0] >= Duration::from_millis(40));
        assert!(gaps[1] >= Duration::from_millis(120));
        assert!(gaps.iter().all(|g| *g < Duration::from_millis(400)), "{gaps:?}");
    }

    #[test]
    fn jitter_stays_between_one_and_two_times() {
        let delay = Duration::from_millis(50);
        for _ in 0..200 {
            let j = add_jitter(delay);
            assert!(j >= delay && j <= delay * 2, "{j:?}");
        }
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn download_errors_classified() {
        let status = |status| DownloadError::Status {
            url: "https://idx.example/a.rar".into(),
            status,
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(
            DownloadError::Network {
                url: "u".into(),
                reason: "reset".into(),
                transient: true,
            }
            .is_retryable()
        );
        assert!(
            !DownloadError::HashMismatch {
                path: PathBuf::from("a"),
                expected: "x".into(),
                actual: "y".into(),
            }
            .is_retryable()
        );
        assert!(!DownloadError::Cancelled.is_retryable());
    }

    #[test]
    fn listing_errors_classified() {
        let url = "https://idx.example/0:/".to_string();
        assert!(
            ListingError::Unreachable {
                url: url.clone(),
                reason: "dns".into(),
            }
            .is_retryable()
        );
        assert!(
            !ListingError::AuthRejected {
                url: url.clone(),
                status: 401,
            }
            .is_retryable()
        );
        assert!(
            !ListingError::Parse {
                url,
                reason: "not json".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn top_level_error_delegates() {
        let err: Error = DownloadError::Status {
            url: "u".into(),
            status: 502,
        }
        .into();
        assert!(err.is_retryable());
        assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t")).is_retryable());
        assert!(
            !Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "d")).is_retryable()
        );
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::config("bad", "--url").is_retryable());
    }
}
