//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod jobs;
mod ledger;
mod outbox;
mod storage;

pub use jobs::{IdempotencyConfig, SchedulerConfig};
pub use ledger::LedgerConfig;
pub use outbox::{OutboxConfig, RetrySettings};
pub use storage::StorageConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LEDGERBOX_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LEDGERBOX";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LEDGERBOX_LOG";

use serde::Deserialize;

/// Error raised while layering configuration sources.
pub type ConfigError = ::config::ConfigError;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database and pool settings.
    pub storage: StorageConfig,
    /// Outbox dispatch settings.
    pub outbox: OutboxConfig,
    /// Idempotency record retention.
    pub idempotency: IdempotencyConfig,
    /// Ledger posting and reconciliation.
    pub ledger: LedgerConfig,
    /// Locked background jobs.
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Config backed by an in-memory database.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig::in_memory(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.path, "data/ledgerbox.db");
        assert!(config.outbox.dispatch_inline);
        assert_eq!(config.idempotency.retention_hours, 72);
        assert_eq!(config.scheduler.default_ttl_ms, 900_000);
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.storage.url(), "sqlite::memory:");
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        use ::config::{File, FileFormat};

        let yaml = r#"
outbox:
  batch_size: 10
  retry:
    base_delay_ms: 50
ledger:
  unmapped_account_id: "9000"
  reconciliation_tolerance: 0.5
"#;
        let config: Config = ::config::Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.outbox.batch_size, 10);
        assert_eq!(config.outbox.retry.base_delay_ms, 50);
        assert_eq!(config.outbox.max_attempts, 10);
        assert_eq!(config.ledger.unmapped_account_id, "9000");
        assert_eq!(
            config.ledger.reconciliation_tolerance,
            rust_decimal::Decimal::new(5, 1)
        );
    }
}
