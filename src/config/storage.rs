//! Storage configuration types.

use serde::Deserialize;

const MEMORY_PATH: &str = ":memory:";

/// SQLite storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path, or `:memory:`.
    pub path: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing with busy.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/ledgerbox.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    /// Single-connection in-memory database.
    pub fn in_memory() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            max_connections: 1,
            ..Self::default()
        }
    }

    /// sqlx connection URL for [`Self::path`].
    pub fn url(&self) -> String {
        if self.path == MEMORY_PATH {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}", self.path)
        }
    }
}
