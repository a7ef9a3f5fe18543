//! Backoff schedules.
//!
//! `RetryConfig` decides when a failed outbox row is tried again; the time is
//! persisted on the row, so the schedule survives restarts. `relay_backoff`
//! covers in-process retries of a whole dispatch pass while the database is
//! unavailable.

use std::time::Duration;

use backon::ExponentialBuilder;
use uuid::Uuid;

/// Redelivery schedule for failed outbox rows.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure, before jitter.
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Failed attempts after which a row is given up on.
    pub max_retries: u32,
    /// Fraction of the delay added or removed at random; 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_retries: 10,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0 for the retry after the first failure).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`, then spread by `jitter`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .checked_mul(1u32 << attempt.min(20))
            .unwrap_or(self.max_delay);
        let capped = doubled.min(self.max_delay);

        if self.jitter <= 0.0 {
            return capped;
        }
        // Uniform in [-1.0, 1.0).
        let unit = (Uuid::new_v4().as_u128() % 2_000) as f64 / 1_000.0 - 1.0;
        capped.mul_f64((1.0 + unit * self.jitter).max(0.0))
    }

    /// Epoch ms at which a row that has now failed `failed_attempts` times is due again.
    pub fn retry_at(&self, failed_attempts: u32, now_ms: i64) -> i64 {
        let delay = self.delay_for_attempt(failed_attempts.saturating_sub(1));
        now_ms.saturating_add(delay.as_millis() as i64)
    }

    /// Whether a row that has failed `attempts` times may be tried again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

/// Backoff for a dispatch pass that failed because the database was unreachable.
///
/// 100ms doubling to 5s, five attempts, jittered.
pub fn relay_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

#[cfg(test)]
mod tests;
