//! Retry with exponential backoff for transient errors (a held state lock).

use crate::error::Result;
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Execute an operation, retrying while it returns a retryable error.
///
/// Non-retryable errors are returned immediately; the last retryable error
/// is returned once attempts run out.
pub fn with_retry<T, F>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:.1}s...",
                    attempt + 1,
                    attempts,
                    e,
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    fn locked() -> Error {
        Error::StateLocked {
            holder: "other".into(),
            lock_id: "l1".into(),
            operation: "apply".into(),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(30),
            ..RetryConfig::new(5, Duration::from_secs(10), 2.0)
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(20));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(30));
    }

    #[test]
    fn test_non_retryable_error_returns_immediately() {
        let attempts = Cell::new(0);
        let result: Result<()> = with_retry(&fast(3), || {
            attempts.set(attempts.get() + 1);
            Err(Error::MissingVariable { name: "x".into() })
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_lock_released_between_attempts() {
        let attempts = Cell::new(0);
        let result = with_retry(&fast(3), || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 { Err(locked()) } else { Ok(7) }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let attempts = Cell::new(0);
        let result: Result<()> = with_retry(&fast(2), || {
            attempts.set(attempts.get() + 1);
            Err(locked())
        });
        assert!(matches!(result, Err(Error::StateLocked { .. })));
        assert_eq!(attempts.get(), 2);
    }
}
