//! Exponential backoff for transient failures.
//!
//! [`RetryPolicy`] computes delays; the engine uses it through the retry
//! scheduler, and [`retry_with_backoff`] drives inline retries such as the
//! instance-id registration after sign-in.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Exponential backoff parameters.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use classy_sync::reliability::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included (default: 5).
    pub max_attempts: u32,
    /// Delay before the first retry (default: 1s).
    pub initial_delay: Duration,
    /// Upper bound for any single delay (default: 60s).
    pub max_delay: Duration,
    /// Growth factor between consecutive delays (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// `initial_delay * multiplier ^ attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss, reason = "acceptable for duration calculations")]
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss, reason = "acceptable for duration calculations")]
        let cap_ms = self.max_delay.as_millis() as f64;
        if !delay_ms.is_finite() || delay_ms >= cap_ms {
            return self.max_delay;
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "delay_ms is finite, non-negative and below max_delay"
        )]
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }

    /// Returns `true` while another attempt is allowed after `attempts`
    /// failed ones.
    #[must_use]
    pub const fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// `[retry]` table of the configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per task.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between delays.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, initial_delay_ms: 1_000, max_delay_ms: 60_000, backoff_multiplier: 2.0 }
    }
}

impl RetryConfig {
    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if `max_attempts` is 0, a delay is 0,
    /// the ceiling is below the initial delay, or the multiplier is below 1.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".to_owned()));
        }
        if self.initial_delay_ms == 0 {
            return Err(SyncError::Config("retry.initial_delay_ms must be positive".to_owned()));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(SyncError::Config(
                "retry.max_delay_ms must not be below initial_delay_ms".to_owned(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::Config("retry.backoff_multiplier must be >= 1.0".to_owned()));
        }
        Ok(())
    }

    /// Converts to a [`RetryPolicy`].
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the policy is
/// exhausted.
///
/// Only errors with [`SyncError::is_retryable`] are retried; any other error
/// returns immediately.
///
/// # Examples
///
/// ```
/// use std::sync::{
///     Arc,
///     atomic::{AtomicU32, Ordering},
/// };
///
/// use classy_sync::{
///     error::SyncError,
///     reliability::{RetryPolicy, retry_with_backoff},
/// };
///
/// # async fn example() -> classy_sync::Result<()> {
/// let policy = RetryPolicy::default();
/// let calls = Arc::new(AtomicU32::new(0));
///
/// let value = retry_with_backoff(&policy, || {
///     let calls = Arc::clone(&calls);
///     async move {
///         if calls.fetch_add(1, Ordering::Relaxed) == 0 {
///             Err(SyncError::Network("connection reset".to_owned()))
///         } else {
///             Ok(7)
///         }
///     }
/// })
/// .await?;
/// assert_eq!(value, 7);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once all
/// attempts are used.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                attempt += 1;
                if !error.is_retryable() || !policy.allows_retry(attempt) {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %error,
                        "Operation failed, giving up"
                    );
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Operation failed, sleeping before retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp, reason = "test code compares exact literals")]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(80));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_config_defaults_and_policy() {
        let config: RetryConfig = toml::from_str("max_attempts = 3").unwrap();
        assert_eq!(config.initial_delay_ms, 1_000);
        let policy = config.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_validation() {
        let bad = [
            RetryConfig { max_attempts: 0, ..RetryConfig::default() },
            RetryConfig { initial_delay_ms: 0, ..RetryConfig::default() },
            RetryConfig { max_delay_ms: 10, initial_delay_ms: 100, ..RetryConfig::default() },
            RetryConfig { backoff_multiplier: 0.5, ..RetryConfig::default() },
            RetryConfig { backoff_multiplier: f64::NAN, ..RetryConfig::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(SyncError::Config(_))), "{config:?}");
        }
    }

    #[tokio::test]
    async fn test_retry_with_backoff_success_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_backoff(&fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Network("reset".to_owned()))
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
    async fn test_retry_with_backoff_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = retry_with_backoff(&fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Network("down".to_owned()))
            }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = retry_with_backoff(&fast_policy(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Unauthorized("expired".to_owned()))
            }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_timing() {
        let start = std::time::Instant::now();
        let _result: Result<()> = retry_with_backoff(&fast_policy(3), || async {
            Err(SyncError::Network("down".to_owned()))
        })
        .await;

        // 10ms + 20ms of backoff between three attempts.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
