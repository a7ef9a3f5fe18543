//! Accounting period close.
//!
//! A period is open until closed; there is no row for an untouched period.
//! Closing requires every action item of the period to be resolved first.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

use crate::error::{codes, CommandError};
use crate::events::{types, NewEvent};
use crate::outbox::{OutboxPublisher, UnitOfWork, WorkOutput};
use crate::storage::schema::{AccountingPeriods, GlUnmappedEvents, GlUnpostedItems, JournalEntries};
use crate::storage::{now_rfc3339, StorageError, TenantId, TenantTx};

use super::{parse_period_id, EntryStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Open,
    Closed,
}

impl PeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Open => "open",
            PeriodStatus::Closed => "closed",
        }
    }
}

/// What kind of open item blocks a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    UnmappedEvent,
    UnpostedItem,
    DraftEntry,
}

/// One unresolved item preventing a period close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseBlocker {
    pub kind: BlockerKind,
    pub id: String,
    pub description: String,
}

/// Result of a successful close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodClosed {
    pub period_id: String,
    pub closed_by: String,
    pub closed_at: String,
}

/// Status of `period_id` as seen by `tx`.
pub(crate) async fn load_period_status(
    tx: &mut TenantTx<'_>,
    period_id: &str,
) -> Result<PeriodStatus, StorageError> {
    let select = Query::select()
        .column(AccountingPeriods::Status)
        .from(AccountingPeriods::Table)
        .and_where(Expr::col(AccountingPeriods::TenantId).eq(tx.tenant().as_str()))
        .and_where(Expr::col(AccountingPeriods::PeriodId).eq(period_id))
        .to_string(SqliteQueryBuilder);

    match tx.fetch_optional(&select).await? {
        Some(row) => {
            let status: String = row.try_get("status")?;
            match status.as_str() {
                "open" => Ok(PeriodStatus::Open),
                "closed" => Ok(PeriodStatus::Closed),
                other => Err(StorageError::InvalidValue {
                    table: "accounting_periods",
                    column: "status",
                    value: other.to_string(),
                }),
            }
        }
        None => Ok(PeriodStatus::Open),
    }
}

/// Unresolved unmapped events, unposted items and drafts of `period_id`.
async fn collect_blockers(
    tx: &mut TenantTx<'_>,
    period_id: &str,
) -> Result<Vec<CloseBlocker>, StorageError> {
    let tenant = tx.tenant().to_string();
    let mut blockers = Vec::new();

    let unmapped = Query::select()
        .columns([
            GlUnmappedEvents::Id,
            GlUnmappedEvents::SourceModule,
            GlUnmappedEvents::SourceReferenceId,
            GlUnmappedEvents::MappingKind,
            GlUnmappedEvents::MappingKey,
        ])
        .from(GlUnmappedEvents::Table)
        .and_where(Expr::col(GlUnmappedEvents::TenantId).eq(tenant.as_str()))
        .and_where(Expr::col(GlUnmappedEvents::PeriodId).eq(period_id))
        .and_where(Expr::col(GlUnmappedEvents::ResolvedAt).is_null())
        .order_by(GlUnmappedEvents::CreatedAt, Order::Asc)
        .to_string(SqliteQueryBuilder);
    for row in tx.fetch_all(&unmapped).await? {
        let module: String = row.try_get("source_module")?;
        let reference: String = row.try_get("source_reference_id")?;
        let kind: String = row.try_get("mapping_kind")?;
        let key: String = row.try_get("mapping_key")?;
        blockers.push(CloseBlocker {
            kind: BlockerKind::UnmappedEvent,
            id: row.try_get("id")?,
            description: format!("{module}/{reference}: no {kind} mapping for '{key}'"),
        });
    }

    let unposted = Query::select()
        .columns([
            GlUnpostedItems::Id,
            GlUnpostedItems::EventType,
            GlUnpostedItems::SourceReferenceId,
            GlUnpostedItems::Reason,
        ])
        .from(GlUnpostedItems::Table)
        .and_where(Expr::col(GlUnpostedItems::TenantId).eq(tenant.as_str()))
        .and_where(Expr::col(GlUnpostedItems::PeriodId).eq(period_id))
        .and_where(Expr::col(GlUnpostedItems::ResolvedAt).is_null())
        .order_by(GlUnpostedItems::CreatedAt, Order::Asc)
        .to_string(SqliteQueryBuilder);
    for row in tx.fetch_all(&unposted).await? {
        let event_type: String = row.try_get("event_type")?;
        let reference: String = row.try_get("source_reference_id")?;
        let reason: String = row.try_get("reason")?;
        blockers.push(CloseBlocker {
            kind: BlockerKind::UnpostedItem,
            id: row.try_get("id")?,
            description: format!("{event_type} {reference} not posted: {reason}"),
        });
    }

    let drafts = Query::select()
        .columns([
            JournalEntries::Id,
            JournalEntries::SourceModule,
            JournalEntries::SourceReferenceId,
        ])
        .from(JournalEntries::Table)
        .and_where(Expr::col(JournalEntries::TenantId).eq(tenant.as_str()))
        .and_where(Expr::col(JournalEntries::PeriodId).eq(period_id))
        .and_where(Expr::col(JournalEntries::Status).eq(EntryStatus::Draft.as_str()))
        .order_by(JournalEntries::CreatedAt, Order::Asc)
        .to_string(SqliteQueryBuilder);
    for row in tx.fetch_all(&drafts).await? {
        let module: String = row.try_get("source_module")?;
        let reference: String = row.try_get("source_reference_id")?;
        blockers.push(CloseBlocker {
            kind: BlockerKind::DraftEntry,
            id: row.try_get("id")?,
            description: format!("draft entry for {module}/{reference}"),
        });
    }

    Ok(blockers)
}

/// Period close and action-item resolution.
#[derive(Clone)]
pub struct PeriodService {
    publisher: OutboxPublisher,
}

impl PeriodService {
    pub fn new(publisher: OutboxPublisher) -> Self {
        Self { publisher }
    }

    /// Close `period_id` once nothing in it is left to resolve.
    pub async fn close_period(
        &self,
        tenant: TenantId,
        period_id: &str,
        closed_by: &str,
    ) -> Result<PeriodClosed, CommandError> {
        let period_id = parse_period_id(period_id)?;
        if closed_by.trim().is_empty() {
            return Err(CommandError::validation("closed_by is required"));
        }
        self.publisher
            .publish(
                tenant,
                ClosePeriod {
                    period_id,
                    closed_by: closed_by.to_string(),
                },
            )
            .await
    }

    pub async fn period_status(
        &self,
        tenant: TenantId,
        period_id: &str,
    ) -> Result<PeriodStatus, CommandError> {
        let period_id = parse_period_id(period_id)?;
        let mut tx = TenantTx::begin(self.publisher.pool(), tenant).await?;
        let status = load_period_status(&mut tx, &period_id).await?;
        tx.rollback().await?;
        Ok(status)
    }

    /// Items that would currently block closing `period_id`.
    pub async fn open_items(
        &self,
        tenant: TenantId,
        period_id: &str,
    ) -> Result<Vec<CloseBlocker>, CommandError> {
        let period_id = parse_period_id(period_id)?;
        let mut tx = TenantTx::begin(self.publisher.pool(), tenant).await?;
        let blockers = collect_blockers(&mut tx, &period_id).await?;
        tx.rollback().await?;
        Ok(blockers)
    }

    /// Mark an unmapped-event row handled. Returns false if it was unknown or already resolved.
    pub async fn resolve_unmapped(
        &self,
        tenant: TenantId,
        id: &str,
        resolved_by: &str,
    ) -> Result<bool, CommandError> {
        let update = Query::update()
            .table(GlUnmappedEvents::Table)
            .value(GlUnmappedEvents::ResolvedAt, now_rfc3339())
            .value(GlUnmappedEvents::ResolvedBy, resolved_by)
            .and_where(Expr::col(GlUnmappedEvents::TenantId).eq(tenant.as_str()))
            .and_where(Expr::col(GlUnmappedEvents::Id).eq(id))
            .and_where(Expr::col(GlUnmappedEvents::ResolvedAt).is_null())
            .to_string(SqliteQueryBuilder);
        self.resolve(tenant, update).await
    }

    /// Mark an unposted item handled (re-posted by hand or written off).
    pub async fn resolve_unposted(&self, tenant: TenantId, id: &str) -> Result<bool, CommandError> {
        let update = Query::update()
            .table(GlUnpostedItems::Table)
            .value(GlUnpostedItems::ResolvedAt, now_rfc3339())
            .and_where(Expr::col(GlUnpostedItems::TenantId).eq(tenant.as_str()))
            .and_where(Expr::col(GlUnpostedItems::Id).eq(id))
            .and_where(Expr::col(GlUnpostedItems::ResolvedAt).is_null())
            .to_string(SqliteQueryBuilder);
        self.resolve(tenant, update).await
    }

    async fn resolve(&self, tenant: TenantId, update: String) -> Result<bool, CommandError> {
        let mut tx = TenantTx::begin(self.publisher.pool(), tenant).await?;
        let resolved = tx.execute(&update).await?.rows_affected() == 1;
        tx.commit().await?;
        Ok(resolved)
    }
}

struct ClosePeriod {
    period_id: String,
    closed_by: String,
}

#[async_trait]
impl UnitOfWork for ClosePeriod {
    type Output = PeriodClosed;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<PeriodClosed>, CommandError> {
        if load_period_status(tx, &self.period_id).await? == PeriodStatus::Closed {
            return Err(CommandError::precondition(
                codes::PERIOD_ALREADY_CLOSED,
                format!("period {} is already closed", self.period_id),
            ));
        }

        let blockers = collect_blockers(tx, &self.period_id).await?;
        if !blockers.is_empty() {
            return Err(CommandError::OpenItems {
                period: self.period_id,
                blockers,
            });
        }

        let closed_at = now_rfc3339();
        let upsert = Query::insert()
            .into_table(AccountingPeriods::Table)
            .columns([
                AccountingPeriods::TenantId,
                AccountingPeriods::PeriodId,
                AccountingPeriods::Status,
                AccountingPeriods::ClosedAt,
                AccountingPeriods::ClosedBy,
            ])
            .values_panic([
                tx.tenant().as_str().into(),
                self.period_id.as_str().into(),
                PeriodStatus::Closed.as_str().into(),
                closed_at.as_str().into(),
                self.closed_by.as_str().into(),
            ])
            .on_conflict(
                OnConflict::columns([AccountingPeriods::TenantId, AccountingPeriods::PeriodId])
                    .update_columns([
                        AccountingPeriods::Status,
                        AccountingPeriods::ClosedAt,
                        AccountingPeriods::ClosedBy,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        tx.execute(&upsert).await?;

        info!(
            tenant_id = %tx.tenant(),
            period_id = %self.period_id,
            closed_by = %self.closed_by,
            "Period closed"
        );

        let closed = PeriodClosed {
            period_id: self.period_id,
            closed_by: self.closed_by,
            closed_at,
        };
        let event = NewEvent::new(types::PERIOD_CLOSED, &closed)?;
        Ok(WorkOutput::new(closed, vec![event]))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::{GlPostingEngine, PostingRequest, Side, SourceLine};
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

    fn tenant() -> TenantId {
        TenantId::from("t1")
    }

    fn adjustment(reference: &str, day: u32) -> PostingRequest {
        let line = |account: &str, side| SourceLine::Account {
            account_id: account.to_string(),
            side,
            amount_cents: 250,
            dimensions: Default::default(),
            memo: None,
        };
        PostingRequest::new(
            "manual",
            reference,
            NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            vec![line("1000", Side::Debit), line("3000", Side::Credit)],
        )
    }

    #[tokio::test]
    async fn test_close_then_reject_second_close() {
        let pool = pool().await;
        let service = PeriodService::new(OutboxPublisher::new(pool.clone()));

        assert_eq!(
            service.period_status(tenant(), "2024-05").await.unwrap(),
            PeriodStatus::Open
        );
        let closed = service
            .close_period(tenant(), "2024-05", "controller")
            .await
            .unwrap();
        assert_eq!(closed.period_id, "2024-05");
        assert_eq!(
            service.period_status(tenant(), "2024-05").await.unwrap(),
            PeriodStatus::Closed
        );

        let err = service
            .close_period(tenant(), "2024-05", "controller")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PERIOD_ALREADY_CLOSED);

        // Other tenants are unaffected.
        assert_eq!(
            service
                .period_status(TenantId::from("t2"), "2024-05")
                .await
                .unwrap(),
            PeriodStatus::Open
        );
    }

    #[tokio::test]
    async fn test_drafts_block_close_until_posted() {
        let pool = pool().await;
        let engine = GlPostingEngine::new(pool.clone(), &LedgerConfig::default());
        let service = PeriodService::new(OutboxPublisher::new(pool.clone()));

        let draft = engine
            .create_draft(tenant(), adjustment("adj-1", 10))
            .await
            .unwrap();

        let err = service
            .close_period(tenant(), "2024-05", "controller")
            .await
            .unwrap_err();
        let CommandError::OpenItems { blockers, .. } = err else {
            panic!("expected open items");
        };
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].kind, BlockerKind::DraftEntry);
        assert_eq!(blockers[0].id, draft.id.to_string());

        engine.post_draft(tenant(), draft.id).await.unwrap();
        service
            .close_period(tenant(), "2024-05", "controller")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolving_items_unblocks_close() {
        let pool = pool().await;
        let service = PeriodService::new(OutboxPublisher::new(pool.clone()));
        sqlx::query(
            "INSERT INTO gl_unposted_items (id, tenant_id, event_id, event_type, source_reference_id, \
             business_date, period_id, reason, created_at) \
             VALUES ('u1', 't1', 'e1', 'sales.sale.completed.v1', 's-9', '2024-05-02', '2024-05', 'bad', '2024-05-02T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let items = service.open_items(tenant(), "2024-05").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, BlockerKind::UnpostedItem);

        assert!(!service.resolve_unposted(TenantId::from("t2"), "u1").await.unwrap());
        assert!(service.resolve_unposted(tenant(), "u1").await.unwrap());
        assert!(!service.resolve_unposted(tenant(), "u1").await.unwrap());

        assert!(service.open_items(tenant(), "2024-05").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_period_id_is_validation() {
        let pool = pool().await;
        let service = PeriodService::new(OutboxPublisher::new(pool));

        let err = service
            .close_period(tenant(), "2024/05", "controller")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }
}
