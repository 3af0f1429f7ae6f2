//! Retry configuration for reaching out-of-process backends.
//!
//! Delays grow exponentially from `initial_backoff`, are jittered, and are capped
//! at `max_backoff` so a long outage does not push reconnects minutes apart.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Default upper bound for a single delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Backoff settings. `max_attempts: None` retries forever.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<usize>,
    /// Accepts human-readable durations like "500ms" or "2s".
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryConfig {
    /// Delays between attempts. Yields `max_attempts - 1` items when bounded.
    pub fn strategy(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        // ExponentialBackoff yields base^n * factor, so base 2 with half the
        // initial delay starts at the initial delay. Clamped to 1 so sub-2ms
        // settings still wait between attempts.
        let factor = (self.initial_backoff.as_millis() as u64 / 2).max(1);
        let cap = self.max_backoff.max(Duration::from_millis(1));
        let delays = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(cap)
            .map(jitter)
            .map(move |delay| delay.min(cap));

        match self.max_attempts {
            Some(max) => Box::new(delays.take(max.saturating_sub(1))),
            None => Box::new(delays),
        }
    }
}

/// Runs `action` until it succeeds or the strategy is exhausted, logging each failure.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    Retry::spawn(config.strategy(), || {
        attempt += 1;
        let fut = action();
        async move {
            fut.await.inspect_err(|e| {
                warn!(attempt, "Attempt failed: {}", e);
            })
        }
    })
    .await
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.initial_backoff, DEFAULT_INITIAL_BACKOFF);
        assert_eq!(config.max_backoff, DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn test_strategy_bounded_attempts() {
        let config = RetryConfig {
            max_attempts: Some(4),
            initial_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(config.strategy().count(), 3);
    }

    #[test]
    fn test_strategy_respects_cap() {
        let config = RetryConfig {
            max_attempts: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
        };
        for delay in config.strategy().take(12) {
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_deserialize_humantime() {
        let yaml = r#"
            max_attempts: 5
            initial_backoff: "250ms"
            max_backoff: "1m"
        "#;
        let config: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let calls = AtomicUsize::new(0);

        let result: Result<usize, String> = retry(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("attempt {n} refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = RetryConfig {
            max_attempts: Some(2),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let calls = AtomicUsize::new(0);

        let result: Result<(), &str> = retry(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("unreachable") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
