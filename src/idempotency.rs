//! Idempotency gate for commands.
//!
//! A command carrying a client request id claims its key inside the same
//! transaction as its domain write. The claim is an `in_progress` row inserted
//! with `ON CONFLICT DO NOTHING`; when the insert is rejected the existing row
//! decides the outcome. Because the claim, the mutation, the completed result
//! and the outbox rows commit together, a retried request either replays the
//! stored result or runs for the first time, never half of each.

use std::time::Duration;

use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::CommandError;
use crate::storage::schema::IdempotencyKeys;
use crate::storage::{now_millis, now_rfc3339, StorageError, TenantTx};

const STATUS_IN_PROGRESS: &str = "in_progress";
const STATUS_COMPLETED: &str = "completed";

/// Caller-supplied request identity, scoped to the transaction's tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub client_request_id: String,
    pub command_name: String,
}

impl IdempotencyKey {
    pub fn new(
        client_request_id: impl Into<String>,
        command_name: impl Into<String>,
    ) -> Result<Self, CommandError> {
        let key = Self {
            client_request_id: client_request_id.into(),
            command_name: command_name.into(),
        };
        if key.client_request_id.trim().is_empty() {
            return Err(CommandError::validation("client request id is required"));
        }
        if key.command_name.trim().is_empty() {
            return Err(CommandError::validation("command name is required"));
        }
        Ok(key)
    }
}

/// Outcome of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyCheck {
    /// First time this key is seen; the caller owns it until commit.
    New,
    /// A completed result already exists and must be returned as-is.
    Duplicate(serde_json::Value),
}

/// Claim `key` for the transaction's tenant.
///
/// Returns [`CommandError::Conflict`] when another request with the same key
/// is still in progress.
pub async fn check_idempotency(
    tx: &mut TenantTx<'_>,
    key: &IdempotencyKey,
) -> Result<IdempotencyCheck, CommandError> {
    let tenant = tx.tenant().to_string();

    let insert = Query::insert()
        .into_table(IdempotencyKeys::Table)
        .columns([
            IdempotencyKeys::TenantId,
            IdempotencyKeys::ClientRequestId,
            IdempotencyKeys::CommandName,
            IdempotencyKeys::Status,
            IdempotencyKeys::CreatedAt,
            IdempotencyKeys::ExpiresAt,
        ])
        .values_panic([
            tenant.clone().into(),
            key.client_request_id.clone().into(),
            key.command_name.clone().into(),
            STATUS_IN_PROGRESS.into(),
            now_rfc3339().into(),
            0i64.into(),
        ])
        .on_conflict(
            OnConflict::columns([
                IdempotencyKeys::TenantId,
                IdempotencyKeys::ClientRequestId,
                IdempotencyKeys::CommandName,
            ])
            .do_nothing()
            .to_owned(),
        )
        .to_string(SqliteQueryBuilder);

    if tx.execute(&insert).await?.rows_affected() == 1 {
        debug!(
            tenant_id = %tenant,
            request_id = %key.client_request_id,
            command = %key.command_name,
            "Idempotency key claimed"
        );
        return Ok(IdempotencyCheck::New);
    }

    let select = Query::select()
        .columns([IdempotencyKeys::Status, IdempotencyKeys::Result])
        .from(IdempotencyKeys::Table)
        .and_where(Expr::col(IdempotencyKeys::TenantId).eq(tenant.clone()))
        .and_where(Expr::col(IdempotencyKeys::ClientRequestId).eq(key.client_request_id.clone()))
        .and_where(Expr::col(IdempotencyKeys::CommandName).eq(key.command_name.clone()))
        .to_string(SqliteQueryBuilder);

    let row = tx.fetch_optional(&select).await?.ok_or_else(|| {
        CommandError::conflict(format!(
            "idempotency key {} vanished while being claimed",
            key.client_request_id
        ))
    })?;

    let status: String = row.try_get("status")?;
    match status.as_str() {
        STATUS_COMPLETED => {
            let raw: Option<String> = row.try_get("result")?;
            let result = match raw {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            };
            info!(
                tenant_id = %tenant,
                request_id = %key.client_request_id,
                command = %key.command_name,
                "Duplicate request, replaying stored result"
            );
            Ok(IdempotencyCheck::Duplicate(result))
        }
        STATUS_IN_PROGRESS => Err(CommandError::conflict(format!(
            "request {} for {} is already in progress",
            key.client_request_id, key.command_name
        ))),
        other => Err(StorageError::InvalidValue {
            table: "idempotency_keys",
            column: "status",
            value: other.to_string(),
        }
        .into()),
    }
}

/// Mark `key` completed with `result`, replayable for `retention`.
///
/// Must run in the transaction that claimed the key.
pub async fn save_idempotency_key(
    tx: &mut TenantTx<'_>,
    key: &IdempotencyKey,
    result: &serde_json::Value,
    retention: Duration,
) -> Result<(), CommandError> {
    let tenant = tx.tenant().to_string();
    let expires_at = now_millis() + retention.as_millis() as i64;

    let update = Query::update()
        .table(IdempotencyKeys::Table)
        .values([
            (IdempotencyKeys::Status, STATUS_COMPLETED.into()),
            (IdempotencyKeys::Result, serde_json::to_string(result)?.into()),
            (IdempotencyKeys::CompletedAt, now_rfc3339().into()),
            (IdempotencyKeys::ExpiresAt, expires_at.into()),
        ])
        .and_where(Expr::col(IdempotencyKeys::TenantId).eq(tenant))
        .and_where(Expr::col(IdempotencyKeys::ClientRequestId).eq(key.client_request_id.clone()))
        .and_where(Expr::col(IdempotencyKeys::CommandName).eq(key.command_name.clone()))
        .and_where(Expr::col(IdempotencyKeys::Status).eq(STATUS_IN_PROGRESS))
        .to_string(SqliteQueryBuilder);

    if tx.execute(&update).await?.rows_affected() != 1 {
        return Err(CommandError::conflict(format!(
            "idempotency key {} was not claimed by this transaction",
            key.client_request_id
        )));
    }
    Ok(())
}

/// Delete completed records whose retention window ended before `now_ms`.
///
/// Cleanup is best effort: failures are logged and reported as zero rows.
pub async fn purge_expired(pool: &SqlitePool, now_ms: i64) -> u64 {
    let delete = Query::delete()
        .from_table(IdempotencyKeys::Table)
        .and_where(Expr::col(IdempotencyKeys::Status).eq(STATUS_COMPLETED))
        .and_where(Expr::col(IdempotencyKeys::ExpiresAt).lte(now_ms))
        .to_string(SqliteQueryBuilder);

    match sqlx::query(&delete).execute(pool).await {
        Ok(result) => {
            let purged = result.rows_affected();
            if purged > 0 {
                info!(purged, "Expired idempotency records removed");
            }
            purged
        }
        Err(e) => {
            warn!(error = %e, "Idempotency retention cleanup failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::storage::{init_schema, TenantId};

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    fn key(id: &str) -> IdempotencyKey {
        IdempotencyKey::new(id, "payments.refund").unwrap()
    }

    #[test]
    fn test_key_requires_both_parts() {
        assert!(matches!(
            IdempotencyKey::new("", "payments.refund"),
            Err(CommandError::Validation(_))
        ));
        assert!(matches!(
            IdempotencyKey::new("req-1", " "),
            Err(CommandError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_completed_key_replays_result() {
        let pool = pool().await;
        let tenant = TenantId::from("t1");

        let mut tx = TenantTx::begin(&pool, tenant.clone()).await.unwrap();
        assert_eq!(
            check_idempotency(&mut tx, &key("req-1")).await.unwrap(),
            IdempotencyCheck::New
        );
        save_idempotency_key(
            &mut tx,
            &key("req-1"),
            &json!({"refundId": "r1"}),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = TenantTx::begin(&pool, tenant).await.unwrap();
        assert_eq!(
            check_idempotency(&mut tx, &key("req-1")).await.unwrap(),
            IdempotencyCheck::Duplicate(json!({"refundId": "r1"}))
        );
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_tenant() {
        let pool = pool().await;

        let mut tx = TenantTx::begin(&pool, TenantId::from("t1")).await.unwrap();
        check_idempotency(&mut tx, &key("req-1")).await.unwrap();
        save_idempotency_key(&mut tx, &key("req-1"), &json!({}), Duration::from_secs(60))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = TenantTx::begin(&pool, TenantId::from("t2")).await.unwrap();
        assert_eq!(
            check_idempotency(&mut tx, &key("req-1")).await.unwrap(),
            IdempotencyCheck::New
        );
    }

    #[tokio::test]
    async fn test_rolled_back_claim_is_released() {
        let pool = pool().await;
        let tenant = TenantId::from("t1");

        let mut tx = TenantTx::begin(&pool, tenant.clone()).await.unwrap();
        check_idempotency(&mut tx, &key("req-1")).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = TenantTx::begin(&pool, tenant).await.unwrap();
        assert_eq!(
            check_idempotency(&mut tx, &key("req-1")).await.unwrap(),
            IdempotencyCheck::New
        );
    }

    #[tokio::test]
    async fn test_in_progress_key_is_a_conflict() {
        let pool = pool().await;
        sqlx::query(
            "INSERT INTO idempotency_keys (tenant_id, client_request_id, command_name, status, created_at, expires_at)
             VALUES ('t1', 'req-1', 'payments.refund', 'in_progress', '2024-01-01T00:00:00Z', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut tx = TenantTx::begin(&pool, TenantId::from("t1")).await.unwrap();
        let err = check_idempotency(&mut tx, &key("req-1")).await.unwrap_err();
        assert!(matches!(err, CommandError::Conflict(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired_completed_records() {
        let pool = pool().await;
        let tenant = TenantId::from("t1");

        let mut tx = TenantTx::begin(&pool, tenant.clone()).await.unwrap();
        check_idempotency(&mut tx, &key("old")).await.unwrap();
        save_idempotency_key(&mut tx, &key("old"), &json!({}), Duration::ZERO)
            .await
            .unwrap();
        check_idempotency(&mut tx, &key("fresh")).await.unwrap();
        save_idempotency_key(&mut tx, &key("fresh"), &json!({}), Duration::from_secs(3600))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(purge_expired(&pool, now_millis() + 1).await, 1);

        let mut tx = TenantTx::begin(&pool, tenant).await.unwrap();
        assert_eq!(
            check_idempotency(&mut tx, &key("old")).await.unwrap(),
            IdempotencyCheck::New
        );
        assert!(matches!(
            check_idempotency(&mut tx, &key("fresh")).await.unwrap(),
            IdempotencyCheck::Duplicate(_)
        ));
    }
}
