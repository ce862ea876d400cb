//! Retry decorator with exponential backoff and jitter.
//!
//! Failures are classified by message substring: a blacklist of permanent
//! failures is consulted before a whitelist of transient ones, and anything
//! unmatched is treated as permanent. Cancellation is never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{BackupItem, BodyReader, Provider};
use crate::error::{Result, SnapError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fractional jitter applied to each delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

const RETRYABLE_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "timeout",
    "temporary failure",
    "network is unreachable",
    "no such host",
    "tls handshake timeout",
    "i/o timeout",
    "eof",
    "broken pipe",
];

const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "access denied",
    "accessdenied",
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
    "nosuchbucket",
    "invalidbucketname",
    "forbidden",
    "unauthorized",
    "invalid key",
];

/// Classify an error message. The blacklist wins over the whitelist.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if NON_RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

fn is_retryable(err: &SnapError) -> bool {
    if err.is_cancelled() {
        return false;
    }
    is_retryable_message(&err.to_string())
}

/// Delay before the given 1-based attempt's retry, pre-jitter.
fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let mut delay = cfg.initial_delay.as_secs_f64();
    for _ in 1..attempt {
        delay *= cfg.backoff_factor;
    }
    Duration::from_secs_f64(delay.min(cfg.max_delay.as_secs_f64()))
}

/// Run `op` with retries on transient failures.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    cfg: &RetryConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 1..=cfg.max_attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                if attempt == cfg.max_attempts {
                    last_err = Some(err);
                    break;
                }

                let base = backoff_delay(cfg, attempt);
                let delay = if cfg.jitter > 0.0 {
                    let factor =
                        1.0 + rand::thread_rng().gen_range(-cfg.jitter..=cfg.jitter);
                    base.mul_f64(factor.max(0.0))
                } else {
                    base
                };

                tracing::warn!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    cfg.max_attempts,
                    err,
                    delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(SnapError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or(SnapError::Cancelled))
}

/// Provider decorator applying [`with_retry`] to download and list.
///
/// Upload is deliberately passed through exactly once: its body is a
/// streaming reader that cannot be rewound, so a second attempt would send
/// an empty or truncated stream.
pub struct RetryingProvider {
    inner: Arc<dyn Provider>,
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn Provider>, config: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            inner,
            config,
            cancel,
        }
    }
}

#[async_trait]
impl Provider for RetryingProvider {
    async fn upload(&self, key: &str, body: BodyReader) -> Result<()> {
        self.inner.upload(key, body).await
    }

    async fn download(&self, key: &str) -> Result<BodyReader> {
        with_retry(&self.cancel, &self.config, || self.inner.download(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>> {
        with_retry(&self.cancel, &self.config, || self.inner.list(prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_classification() {
        assert!(is_retryable_message("read tcp: connection reset by peer"));
        assert!(is_retryable_message("TLS handshake timeout"));
        assert!(is_retryable_message("unexpected EOF"));
        assert!(!is_retryable_message("AccessDenied: not allowed"));
        assert!(!is_retryable_message("NoSuchBucket"));
        assert!(!is_retryable_message("some unknown failure"));
        // Blacklist wins even when a whitelisted marker is present.
        assert!(!is_retryable_message("timeout waiting for AccessDenied response"));
    }

    #[test]
    fn test_backoff_monotonic_up_to_cap() {
        let cfg = RetryConfig::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..10 {
            let d = backoff_delay(&cfg, attempt);
            assert!(d >= prev, "delay regressed at attempt {attempt}");
            assert!(d <= cfg.max_delay);
            prev = d;
        }
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&cfg, 9), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_non_retryable_attempts_once() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry(&cancel, &fast_config(3), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SnapError::StorageAccessDenied("AccessDenied".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_up_to_max_attempts() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry(&cancel, &fast_config(3), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SnapError::NetworkTimeout("i/o timeout".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = with_retry(&cancel, &fast_config(3), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(SnapError::NetworkTimeout("timeout".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_not_retried() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry(&cancel, &fast_config(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SnapError::Cancelled) }
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
