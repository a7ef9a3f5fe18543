//! Event dispatch and consumer-side deduplication.
//!
//! The dispatcher reads committed outbox rows, leases each one to itself,
//! and hands the envelope to every consumer interested in its type. A consumer
//! runs in its own tenant transaction guarded by a `processed_events` row keyed
//! by (event id, consumer name), so redelivery after a crash or a failed
//! sibling consumer never applies an effect twice.
//!
//! Ordering is per tenant: when one of a tenant's rows fails, is not yet due,
//! or is leased by another worker, the tenant's later rows wait for the next
//! pass. A tenant whose oldest unfinished row is waiting is left out of the
//! batch altogether. Nothing is ordered across tenants.

pub mod relay;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sea_query::{Cond, Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::CommandError;
use crate::events::EventEnvelope;
use crate::outbox::{OutboxEntry, OutboxStatus};
use crate::storage::schema::{OutboxEntries, ProcessedEvents};
use crate::storage::{now_millis, now_rfc3339, StorageError, TenantId, TenantTx};
use crate::utils::retry::RetryConfig;

pub use relay::{spawn_relay, RelayHandle};

/// Unfinished rows of tenants whose oldest unfinished row can be leased now,
/// ranked within each tenant so one backlog cannot crowd the others out of a
/// batch. Dead and dispatched rows are not unfinished.
const DUE_ROWS_SQL: &str = r#"
WITH unfinished AS (
    SELECT *, ROW_NUMBER() OVER (PARTITION BY tenant_id ORDER BY position) AS tenant_rank
    FROM outbox_entries
    WHERE status IN ('pending', 'in_flight')
      AND (? IS NULL OR tenant_id = ?)
),
ready AS (
    SELECT tenant_id FROM unfinished
    WHERE tenant_rank = 1
      AND next_attempt_at <= ?
      AND (status = 'pending' OR locked_until <= ?)
)
SELECT * FROM unfinished
WHERE tenant_id IN (SELECT tenant_id FROM ready)
ORDER BY tenant_rank, position
LIMIT ?
"#;

/// A projection or side effect driven by outbox events.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Stable name; part of the dedup key, so renaming replays history.
    fn name(&self) -> &str;

    fn handles(&self, event_type: &str) -> bool;

    /// Apply `event` through `tx`. Returning `Err` rolls back the effect and
    /// the dedup record together.
    async fn handle(&self, tx: &mut TenantTx<'_>, event: &EventEnvelope) -> Result<(), CommandError>;
}

/// Result of offering one event to one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    AlreadyProcessed,
}

/// Deliver `event` to `consumer` at most once in effect.
pub async fn consume_once(
    pool: &SqlitePool,
    consumer: &dyn EventConsumer,
    event: &EventEnvelope,
) -> Result<Delivery, CommandError> {
    let mut tx = TenantTx::begin(pool, event.tenant_id.clone()).await?;

    let insert = Query::insert()
        .into_table(ProcessedEvents::Table)
        .columns([
            ProcessedEvents::EventId,
            ProcessedEvents::ConsumerName,
            ProcessedEvents::TenantId,
            ProcessedEvents::ProcessedAt,
        ])
        .values_panic([
            event.event_id.to_string().into(),
            consumer.name().into(),
            event.tenant_id.to_string().into(),
            now_rfc3339().into(),
        ])
        .on_conflict(
            OnConflict::columns([ProcessedEvents::EventId, ProcessedEvents::ConsumerName])
                .do_nothing()
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder);

    if tx.execute(&insert).await?.rows_affected() == 0 {
        tx.rollback().await?;
        debug!(
            consumer = consumer.name(),
            event_id = %event.event_id,
            "Event already processed"
        );
        return Ok(Delivery::AlreadyProcessed);
    }

    consumer.handle(&mut tx, event).await?;
    tx.commit().await?;

    debug!(
        consumer = consumer.name(),
        tenant_id = %event.tenant_id,
        event_id = %event.event_id,
        event_type = %event.event_type,
        "Event applied"
    );
    Ok(Delivery::Applied)
}

/// One failed delivery in a dispatch pass.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub position: i64,
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub consumer: String,
    pub error: String,
    /// Attempts recorded on the row after this failure.
    pub attempts: u32,
    /// The row ran out of attempts and was marked dead.
    pub dead: bool,
}

/// Summary of one dispatch pass.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Rows delivered to every interested consumer and marked dispatched.
    pub processed: usize,
    /// Deliveries a consumer had already applied.
    pub skipped: usize,
    /// Selected rows held back behind a row of the same tenant that failed,
    /// was not yet due, or was leased elsewhere during this pass.
    pub deferred: usize,
    pub errors: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Delivers committed outbox rows to registered consumers.
pub struct Dispatcher {
    pool: SqlitePool,
    consumers: Vec<Arc<dyn EventConsumer>>,
    worker_id: String,
    batch_size: u32,
    lease_ms: i64,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(pool: SqlitePool, config: &OutboxConfig) -> Self {
        Self {
            pool,
            consumers: Vec::new(),
            worker_id: format!("dispatcher-{}", Uuid::new_v4()),
            batch_size: config.batch_size.max(1),
            lease_ms: config.lease().as_millis() as i64,
            retry: config.retry_config(),
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        info!(consumer = consumer.name(), "Consumer registered");
        self.consumers.push(consumer);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Dispatch due rows of every tenant.
    pub async fn dispatch_pending(&self) -> Result<DispatchReport, StorageError> {
        self.dispatch(None).await
    }

    /// Dispatch due rows of one tenant.
    pub async fn dispatch_tenant(&self, tenant: &TenantId) -> Result<DispatchReport, StorageError> {
        self.dispatch(Some(tenant)).await
    }

    async fn dispatch(&self, tenant: Option<&TenantId>) -> Result<DispatchReport, StorageError> {
        let now = now_millis();

        let tenant = tenant.map(TenantId::as_str);
        let rows = sqlx::query(DUE_ROWS_SQL)
            .bind(tenant)
            .bind(tenant)
            .bind(now)
            .bind(now)
            .bind(i64::from(self.batch_size))
            .fetch_all(&self.pool)
            .await?;

        let mut report = DispatchReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for row in &rows {
            let row_tenant: String = row.try_get("tenant_id")?;
            if blocked.contains(&row_tenant) {
                report.deferred += 1;
                continue;
            }

            let entry = match OutboxEntry::from_row(row) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(tenant_id = %row_tenant, error = %e, "Unreadable outbox row");
                    blocked.insert(row_tenant);
                    report.deferred += 1;
                    continue;
                }
            };

            if entry.next_attempt_at > now || !self.claim(&entry, now).await? {
                blocked.insert(row_tenant);
                report.deferred += 1;
                continue;
            }

            match self.deliver(&entry, &mut report).await {
                None => {
                    self.mark_dispatched(&entry).await?;
                    report.processed += 1;
                }
                Some((consumer, err)) => {
                    if let Some(failure) = self.mark_failed(&entry, consumer, &err).await? {
                        report.errors.push(failure);
                    }
                    blocked.insert(row_tenant);
                }
            }
        }

        if report.processed > 0 || !report.errors.is_empty() {
            info!(
                processed = report.processed,
                skipped = report.skipped,
                deferred = report.deferred,
                failed = report.errors.len(),
                "Dispatch pass complete"
            );
        }
        Ok(report)
    }

    /// Lease `entry` to this worker. A lapsed lease of another worker may be taken over.
    async fn claim(&self, entry: &OutboxEntry, now: i64) -> Result<bool, StorageError> {
        let update = Query::update()
            .table(OutboxEntries::Table)
            .values([
                (OutboxEntries::Status, OutboxStatus::InFlight.as_str().into()),
                (OutboxEntries::LockedBy, self.worker_id.clone().into()),
                (OutboxEntries::LockedUntil, (now + self.lease_ms).into()),
            ])
            .and_where(Expr::col(OutboxEntries::Position).eq(entry.position))
            .and_where(Expr::col(OutboxEntries::NextAttemptAt).lte(now))
            .cond_where(
                Cond::any()
                    .add(Expr::col(OutboxEntries::Status).eq(OutboxStatus::Pending.as_str()))
                    .add(
                        Cond::all()
                            .add(
                                Expr::col(OutboxEntries::Status)
                                    .eq(OutboxStatus::InFlight.as_str()),
                            )
                            .add(Expr::col(OutboxEntries::LockedUntil).lte(now)),
                    ),
            )
            .to_string(SqliteQueryBuilder);

        let claimed = sqlx::query(&update).execute(&self.pool).await?.rows_affected() == 1;
        if !claimed {
            debug!(
                position = entry.position,
                event_id = %entry.envelope.event_id,
                "Outbox row leased elsewhere"
            );
        }
        Ok(claimed)
    }

    /// Offer the event to each interested consumer; stop at the first failure.
    async fn deliver(
        &self,
        entry: &OutboxEntry,
        report: &mut DispatchReport,
    ) -> Option<(String, CommandError)> {
        let event_type = entry.envelope.event_type.as_str();

        for consumer in self.consumers.iter().filter(|c| c.handles(event_type)) {
            match consume_once(&self.pool, consumer.as_ref(), &entry.envelope).await {
                Ok(Delivery::Applied) => {}
                Ok(Delivery::AlreadyProcessed) => report.skipped += 1,
                Err(e) => return Some((consumer.name().to_string(), e)),
            }
        }
        None
    }

    async fn mark_dispatched(&self, entry: &OutboxEntry) -> Result<(), StorageError> {
        let update = Query::update()
            .table(OutboxEntries::Table)
            .values([
                (OutboxEntries::Status, OutboxStatus::Dispatched.as_str().into()),
                (OutboxEntries::DispatchedAt, now_rfc3339().into()),
                (OutboxEntries::LastError, Option::<String>::None.into()),
                (OutboxEntries::LockedBy, Option::<String>::None.into()),
                (OutboxEntries::LockedUntil, Option::<i64>::None.into()),
            ])
            .and_where(Expr::col(OutboxEntries::Position).eq(entry.position))
            .and_where(Expr::col(OutboxEntries::LockedBy).eq(self.worker_id.as_str()))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&update).execute(&self.pool).await?.rows_affected() == 0 {
            warn!(
                position = entry.position,
                event_id = %entry.envelope.event_id,
                "Lease lost before marking dispatched"
            );
        }
        Ok(())
    }

    /// Record the failure and schedule the retry. `None` when the lease was
    /// taken over meanwhile; the new holder owns the row's bookkeeping.
    async fn mark_failed(
        &self,
        entry: &OutboxEntry,
        consumer: String,
        err: &CommandError,
    ) -> Result<Option<DispatchFailure>, StorageError> {
        let attempts = entry.attempts + 1;
        let dead = !self.retry.should_retry(attempts);
        let status = if dead {
            OutboxStatus::Dead
        } else {
            OutboxStatus::Pending
        };
        let next_attempt_at = self.retry.retry_at(attempts, now_millis());
        let message = format!("{consumer}: {err}");

        let update = Query::update()
            .table(OutboxEntries::Table)
            .values([
                (OutboxEntries::Status, status.as_str().into()),
                (OutboxEntries::Attempts, i64::from(attempts).into()),
                (OutboxEntries::LastError, message.clone().into()),
                (OutboxEntries::NextAttemptAt, next_attempt_at.into()),
                (OutboxEntries::LockedBy, Option::<String>::None.into()),
                (OutboxEntries::LockedUntil, Option::<i64>::None.into()),
            ])
            .and_where(Expr::col(OutboxEntries::Position).eq(entry.position))
            .and_where(Expr::col(OutboxEntries::LockedBy).eq(self.worker_id.as_str()))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&update).execute(&self.pool).await?.rows_affected() == 0 {
            debug!(
                position = entry.position,
                event_id = %entry.envelope.event_id,
                consumer = %consumer,
                error = %err,
                "Lease lost before recording failure"
            );
            return Ok(None);
        }

        if dead {
            error!(
                tenant_id = %entry.envelope.tenant_id,
                event_id = %entry.envelope.event_id,
                consumer = %consumer,
                attempts,
                error = %err,
                "Outbox row dead after final attempt"
            );
        } else {
            warn!(
                tenant_id = %entry.envelope.tenant_id,
                event_id = %entry.envelope.event_id,
                consumer = %consumer,
                attempts,
                error = %err,
                "Delivery failed, will retry"
            );
        }

        Ok(Some(DispatchFailure {
            position: entry.position,
            event_id: entry.envelope.event_id,
            tenant_id: entry.envelope.tenant_id.clone(),
            consumer,
            error: message,
            attempts,
            dead,
        }))
    }

    /// Return a dead row to `pending` with a fresh attempt budget.
    pub async fn requeue_dead(&self, tenant: &TenantId, event_id: Uuid) -> Result<bool, StorageError> {
        let update = Query::update()
            .table(OutboxEntries::Table)
            .values([
                (OutboxEntries::Status, OutboxStatus::Pending.as_str().into()),
                (OutboxEntries::Attempts, 0i64.into()),
                (OutboxEntries::NextAttemptAt, 0i64.into()),
            ])
            .and_where(Expr::col(OutboxEntries::TenantId).eq(tenant.as_str()))
            .and_where(Expr::col(OutboxEntries::EventId).eq(event_id.to_string()))
            .and_where(Expr::col(OutboxEntries::Status).eq(OutboxStatus::Dead.as_str()))
            .to_string(SqliteQueryBuilder);

        let requeued = sqlx::query(&update).execute(&self.pool).await?.rows_affected() == 1;
        if requeued {
            info!(tenant_id = %tenant, event_id = %event_id, "Dead outbox row requeued");
        }
        Ok(requeued)
    }
}
