//! Transactional outbox.
//!
//! Events are written to `outbox_entries` inside the transaction that performs
//! the mutation they describe, so a row exists if and only if that mutation
//! committed. Delivery happens afterwards, from the committed rows, by the
//! [`crate::dispatch::Dispatcher`].

mod publisher;

pub use publisher::{CommandOutcome, OutboxPublisher, UnitOfWork, WorkOutput};

use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::events::{EventEnvelope, EventType, NewEvent};
use crate::storage::schema::OutboxEntries;
use crate::storage::{parse_rfc3339, Result, StorageError, TenantId, TenantTx};

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Dispatched,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Dead => "dead",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(OutboxStatus::Pending),
            "in_flight" => Ok(OutboxStatus::InFlight),
            "dispatched" => Ok(OutboxStatus::Dispatched),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(StorageError::InvalidValue {
                table: "outbox_entries",
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A stored event with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub position: i64,
    pub envelope: EventEnvelope,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Epoch ms before which the row is not retried.
    pub next_attempt_at: i64,
    pub locked_by: Option<String>,
    /// Epoch ms at which the current lease lapses.
    pub locked_until: Option<i64>,
    pub dispatched_at: Option<String>,
}

impl OutboxEntry {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let event_id: String = row.try_get("event_id")?;
        let event_type: String = row.try_get("event_type")?;
        let occurred_at: String = row.try_get("occurred_at")?;
        let payload: String = row.try_get("payload")?;
        let status: String = row.try_get("status")?;
        let attempts: i64 = row.try_get("attempts")?;

        let envelope = EventEnvelope {
            event_id: Uuid::parse_str(&event_id).map_err(|_| StorageError::InvalidValue {
                table: "outbox_entries",
                column: "event_id",
                value: event_id.clone(),
            })?,
            event_type: EventType::try_from(event_type.clone()).map_err(|_| {
                StorageError::InvalidValue {
                    table: "outbox_entries",
                    column: "event_type",
                    value: event_type,
                }
            })?,
            tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
            occurred_at: parse_rfc3339(&occurred_at)?,
            data: serde_json::from_str(&payload)?,
        };

        Ok(Self {
            position: row.try_get("position")?,
            envelope,
            status: OutboxStatus::parse(&status)?,
            attempts: attempts.max(0) as u32,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            locked_by: row.try_get("locked_by")?,
            locked_until: row.try_get("locked_until")?,
            dispatched_at: row.try_get("dispatched_at")?,
        })
    }
}

/// Record `events` in the outbox of the transaction's tenant.
///
/// Returns the stamped envelopes in insertion order.
pub async fn append(tx: &mut TenantTx<'_>, events: Vec<NewEvent>) -> Result<Vec<EventEnvelope>> {
    let mut envelopes = Vec::with_capacity(events.len());

    for event in events {
        let envelope = EventEnvelope::stamp(tx.tenant(), event);

        let insert = Query::insert()
            .into_table(OutboxEntries::Table)
            .columns([
                OutboxEntries::EventId,
                OutboxEntries::EventType,
                OutboxEntries::TenantId,
                OutboxEntries::OccurredAt,
                OutboxEntries::Payload,
                OutboxEntries::Status,
            ])
            .values_panic([
                envelope.event_id.to_string().into(),
                envelope.event_type.to_string().into(),
                envelope.tenant_id.to_string().into(),
                envelope.occurred_at.to_rfc3339().into(),
                serde_json::to_string(&envelope.data)?.into(),
                OutboxStatus::Pending.as_str().into(),
            ])
            .to_string(SqliteQueryBuilder);

        tx.execute(&insert).await?;
        debug!(
            tenant_id = %envelope.tenant_id,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "Event written to outbox"
        );
        envelopes.push(envelope);
    }

    Ok(envelopes)
}

/// All outbox rows of `tenant` in position order.
pub async fn entries_for_tenant(pool: &SqlitePool, tenant: &TenantId) -> Result<Vec<OutboxEntry>> {
    let select = Query::select()
        .expr(Expr::cust("*"))
        .from(OutboxEntries::Table)
        .and_where(Expr::col(OutboxEntries::TenantId).eq(tenant.as_str()))
        .order_by(OutboxEntries::Position, Order::Asc)
        .to_string(SqliteQueryBuilder);

    let rows = sqlx::query(&select).fetch_all(pool).await?;
    rows.iter().map(OutboxEntry::from_row).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::events::types;
    use crate::storage::init_schema;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_append_preserves_insertion_order() {
        let pool = pool().await;
        let tenant = TenantId::from("t1");

        let mut tx = TenantTx::begin(&pool, tenant.clone()).await.unwrap();
        let events = (0..3)
            .map(|i| NewEvent::new(types::PAYMENT_CAPTURED, json!({ "n": i })).unwrap())
            .collect();
        let envelopes = append(&mut tx, events).await.unwrap();
        tx.commit().await.unwrap();

        let entries = entries_for_tenant(&pool, &tenant).await.unwrap();
        assert_eq!(entries.len(), 3);
        for (i, (entry, envelope)) in entries.iter().zip(&envelopes).enumerate() {
            assert_eq!(&entry.envelope, envelope);
            assert_eq!(entry.envelope.data["n"], i);
            assert_eq!(entry.status, OutboxStatus::Pending);
            assert_eq!(entry.attempts, 0);
        }
        assert!(entries.windows(2).all(|w| w[0].position < w[1].position));
    }

    #[tokio::test]
    async fn test_append_is_undone_by_rollback() {
        let pool = pool().await;
        let tenant = TenantId::from("t1");

        let mut tx = TenantTx::begin(&pool, tenant.clone()).await.unwrap();
        let event = NewEvent::new(types::PAYMENT_CAPTURED, json!({})).unwrap();
        append(&mut tx, vec![event]).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(entries_for_tenant(&pool, &tenant).await.unwrap().is_empty());
    }
}
