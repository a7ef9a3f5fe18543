//! Outbox dispatch configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::RetryConfig;

/// Outbox configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Dispatch a tenant's pending events right after its command commits. Default: true.
    pub dispatch_inline: bool,
    /// Rows loaded per dispatch pass. Default: 100.
    pub batch_size: u32,
    /// Delivery attempts before a row is marked dead. Default: 10.
    pub max_attempts: u32,
    /// How long a claimed row stays leased to one worker. Default: 30.
    pub lease_secs: u64,
    /// Background relay poll interval. Default: 1000.
    pub poll_interval_ms: u64,
    /// Redelivery backoff.
    pub retry: RetrySettings,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            dispatch_inline: true,
            batch_size: 100,
            max_attempts: 10,
            lease_secs: 30,
            poll_interval_ms: 1_000,
            retry: RetrySettings::default(),
        }
    }
}

impl OutboxConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff schedule for failed deliveries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_retries: self.max_attempts,
            jitter: self.retry.jitter,
        }
    }
}

/// Backoff settings as they appear in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomised in either direction.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_config_default() {
        let config = OutboxConfig::default();
        assert!(config.dispatch_inline);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.lease(), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_config_carries_attempt_budget() {
        let config = OutboxConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(300));
    }
}
