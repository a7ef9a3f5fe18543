//! Bootstrap utilities for the worker binary.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LOG_ENV_VAR};
use crate::dispatch::Dispatcher;
use crate::outbox::OutboxPublisher;
use crate::storage::{self, StorageError};

/// Initialize tracing with the LEDGERBOX_LOG environment variable.
///
/// Defaults to "info" level if LEDGERBOX_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Open the configured database and make sure the schema exists.
pub async fn init_pool(config: &Config) -> Result<SqlitePool, StorageError> {
    let pool = storage::init_storage(&config.storage).await?;
    info!(
        max_connections = config.storage.max_connections,
        "Storage ready"
    );
    Ok(pool)
}

/// Outbox publisher with the configured idempotency retention, dispatching
/// inline through `dispatcher` when `outbox.dispatch_inline` is set.
pub fn build_publisher(
    config: &Config,
    pool: SqlitePool,
    dispatcher: Option<Arc<Dispatcher>>,
) -> OutboxPublisher {
    let publisher = OutboxPublisher::new(pool).with_retention(config.idempotency.retention());
    match dispatcher {
        Some(dispatcher) if config.outbox.dispatch_inline => publisher.with_inline_dispatch(dispatcher),
        _ => publisher,
    }
}
