//! Database-backed distributed lock.
//!
//! A lock is a row in `distributed_locks`. Acquisition is a single upsert that
//! only replaces an existing row once its `expires_at` has passed, so exactly
//! one contender wins and a crashed holder is recovered by TTL expiry.
//!
//! There is no heartbeat: work that outlives its TTL can overlap with the next
//! holder. Choose a TTL comfortably above the job's worst-case duration.

use std::future::Future;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::{now_millis, StorageError};

/// Known lock names.
pub mod names {
    pub const BACKUP_SCHEDULER: &str = "backup-scheduler";
    pub const IDEMPOTENCY_RETENTION: &str = "idempotency-retention";
}

const ACQUIRE_SQL: &str = r#"
INSERT INTO distributed_locks (name, holder, acquired_at, expires_at, context)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT(name) DO UPDATE SET
    holder = excluded.holder,
    acquired_at = excluded.acquired_at,
    expires_at = excluded.expires_at,
    context = excluded.context
WHERE distributed_locks.expires_at <= ?
"#;

const RELEASE_SQL: &str = "DELETE FROM distributed_locks WHERE name = ? AND holder = ?";

/// Proof of holding a lock until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub holder: String,
    /// Epoch ms.
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct DistributedLock {
    pool: SqlitePool,
}

impl DistributedLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Take `name` for `ttl` unless someone else holds an unexpired lease.
    pub async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
        context: &serde_json::Value,
    ) -> Result<Option<LockLease>, StorageError> {
        let now = now_millis();
        let holder = Uuid::new_v4().to_string();
        let expires_at = now + ttl.as_millis() as i64;

        let result = sqlx::query(ACQUIRE_SQL)
            .bind(name)
            .bind(&holder)
            .bind(now)
            .bind(expires_at)
            .bind(serde_json::to_string(context)?)
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            info!(lock = name, holder = %holder, ttl_ms = ttl.as_millis() as u64, context = %context, "Lock acquired");
            Ok(Some(LockLease {
                name: name.to_string(),
                holder,
                expires_at,
            }))
        } else {
            debug!(lock = name, "Lock held elsewhere");
            Ok(None)
        }
    }

    /// Release `lease`. Returns false when the lease already expired and was taken over.
    pub async fn release(&self, lease: &LockLease) -> Result<bool, StorageError> {
        let result = sqlx::query(RELEASE_SQL)
            .bind(&lease.name)
            .bind(&lease.holder)
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected() == 1;
        if released {
            debug!(lock = %lease.name, holder = %lease.holder, "Lock released");
        } else {
            warn!(lock = %lease.name, holder = %lease.holder, "Lock lost before release");
        }
        Ok(released)
    }

    /// Run `f` while holding `name`.
    ///
    /// Returns `Ok(None)` without running `f` when the lock is held elsewhere.
    /// A failed release is logged; the lease then lapses at its TTL.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl: Duration,
        context: serde_json::Value,
        f: F,
    ) -> Result<Option<T>, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(lease) = self.try_acquire(name, ttl, &context).await? else {
            return Ok(None);
        };

        let output = f().await;

        if let Err(e) = self.release(&lease).await {
            warn!(lock = name, error = %e, "Lock release failed, waiting for TTL");
        }
        Ok(Some(output))
    }
}
