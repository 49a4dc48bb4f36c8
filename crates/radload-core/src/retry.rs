//! Whole-exchange retry policy with a fixed backoff.

use serde::Deserialize;
use std::time::Duration;

use crate::client::ExchangeError;

/// Retry settings as they appear in the `[retry]` config section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Extra attempts after the first failed exchange (0 disables retries)
    #[serde(default)]
    pub max_retries: u32,
    /// Fixed pause between attempts in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    100
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// A policy that never retries.
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.backoff_ms))
    }

    /// `attempt` counts retries already made for this task.
    pub fn should_retry(&self, error: &ExchangeError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radius::PacketError;

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.backoff_ms, 100);
        assert_eq!(
            RetryPolicy::from_config(&config).backoff(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let timeout = ExchangeError::Timeout { attempts: 3 };

        assert!(policy.should_retry(&timeout, 0));
        assert!(policy.should_retry(&timeout, 1));
        assert!(!policy.should_retry(&timeout, 2));

        let build = ExchangeError::Build(PacketError::PasswordTooLong(200));
        assert!(!policy.should_retry(&build, 0));
    }

    #[test]
    fn test_none_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(&ExchangeError::Timeout { attempts: 1 }, 0));
    }
}
