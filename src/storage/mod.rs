//! Storage plumbing.
//!
//! Everything the consistency layer persists lives in one SQLite database
//! reached through a `sqlx` pool. Statements are built with `sea-query` and
//! rendered with `SqliteQueryBuilder`; the few conditional upserts that depend
//! on `ON CONFLICT ... WHERE` or `RETURNING` are written as bound SQL.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::StorageConfig;

pub mod schema;
pub mod tenant;

pub use tenant::{TenantId, TenantTx};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored value in {table}.{column}: {value}")]
    InvalidValue {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl StorageError {
    /// Whether the database rejected the write because of a unique key.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StorageError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }

    /// Whether SQLite refused the statement because another writer holds the lock.
    ///
    /// Covers `SQLITE_BUSY` (5), `SQLITE_LOCKED` (6) and their extended codes.
    pub fn is_busy(&self) -> bool {
        match self {
            StorageError::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Open a connection pool for the configured database.
pub async fn connect(config: &StorageConfig) -> Result<SqlitePool> {
    info!(path = %config.path, "Storage: sqlite");

    let options = SqliteConnectOptions::from_str(&config.url())?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Connect and create every table the consistency layer needs.
pub async fn init_storage(config: &StorageConfig) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(&config.path).parent() {
        if !parent.as_os_str().is_empty() && config.path != ":memory:" {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::InvalidValue {
                table: "-",
                column: "path",
                value: format!("{}: {}", parent.display(), e),
            })?;
        }
    }

    let pool = connect(config).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes (idempotent).
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in schema::ALL_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    info!(tables = schema::ALL_TABLES.len(), "Schema initialized");
    Ok(())
}

/// Current wall-clock time as epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall-clock time as RFC 3339.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 timestamp read back from a text column.
pub(crate) fn parse_rfc3339(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{value}: {e}")))
}
