//! Idempotency retention and scheduled job configuration.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long completed results are replayable. Default: 72.
    pub retention_hours: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
        }
    }
}

impl IdempotencyConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lock TTL for jobs that do not name their own. Default: 900000 (15 minutes).
    pub default_ttl_ms: u64,
    /// Minimum spacing between retention cleanup runs. Default: 3600.
    pub retention_every_secs: u64,
    /// How often the worker checks whether jobs are due. Default: 60.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 900_000,
            retention_every_secs: 3_600,
            tick_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn retention_every(&self) -> Duration {
        Duration::from_secs(self.retention_every_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}
