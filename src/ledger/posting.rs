//! Journal posting engine.
//!
//! [`GlPostingEngine::post_in`] is the core: it runs inside a caller's tenant
//! transaction, so a posting can share a commit with the mutation or consumer
//! effect that caused it. The other operations wrap it (or the draft and void
//! paths) in their own outbox transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::{codes, CommandError};
use crate::events::{types, NewEvent};
use crate::idempotency::IdempotencyKey;
use crate::outbox::{CommandOutcome, OutboxPublisher, UnitOfWork, WorkOutput};
use crate::storage::schema::{GlAccountBalances, JournalEntries, JournalLines};
use crate::storage::{now_rfc3339, StorageError, TenantId, TenantTx};

use super::builder::{reverse_lines, LineBuilder};
use super::mapping::{
    record_unmapped, InvalidateFn, MappingCache, MappingKind, MappingResolver, SourceRef,
};
use super::period::{load_period_status, PeriodStatus};
use super::{
    period_id_for, AccountBalance, Dimensions, EntryStatus, JournalEntry, JournalLine,
    PostingOutcome, PostingRequest, Side, SkipReason, SourceLine, UnmappedMapping,
};

const NEXT_NUMBER_SQL: &str = r#"
INSERT INTO journal_sequences (tenant_id, last_number) VALUES (?, 1)
ON CONFLICT(tenant_id) DO UPDATE SET last_number = last_number + 1
RETURNING last_number
"#;

const APPLY_BALANCE_SQL: &str = r#"
INSERT INTO gl_account_balances (tenant_id, account_id, period_id, debit_cents, credit_cents)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT(tenant_id, account_id, period_id) DO UPDATE SET
    debit_cents = debit_cents + excluded.debit_cents,
    credit_cents = credit_cents + excluded.credit_cents
"#;

/// Result of voiding a posted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoidOutcome {
    pub entry_id: Uuid,
    pub reversal_entry_id: Uuid,
    pub reversal_journal_number: i64,
    pub period_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JournalPosted<'a> {
    entry_id: Uuid,
    journal_number: i64,
    period_id: &'a str,
    business_date: NaiveDate,
    source_module: &'a str,
    source_reference_id: &'a str,
    total_cents: i64,
    lines: &'a [JournalLine],
    unmapped: &'a [UnmappedMapping],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostingSkipped<'a> {
    source_module: &'a str,
    source_reference_id: &'a str,
    business_date: NaiveDate,
    reason: SkipReason,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JournalVoided<'a> {
    entry_id: Uuid,
    journal_number: Option<i64>,
    reversal_entry_id: Uuid,
    reversal_journal_number: i64,
    period_id: &'a str,
    reason: &'a str,
}

/// Turns source documents into balanced, numbered journal entries.
pub struct GlPostingEngine {
    pool: SqlitePool,
    resolver: MappingResolver,
    publisher: OutboxPublisher,
}

impl GlPostingEngine {
    pub fn new(pool: SqlitePool, config: &LedgerConfig) -> Self {
        let cache = Arc::new(MappingCache::new(config.mapping_cache_ttl()));
        Self {
            resolver: MappingResolver::new(cache, config.unmapped_account_id.clone()),
            publisher: OutboxPublisher::new(pool.clone()),
            pool,
        }
    }

    /// Use `publisher` (typically one with inline dispatch) for the engine's own commands.
    pub fn with_publisher(mut self, publisher: OutboxPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn resolver(&self) -> &MappingResolver {
        &self.resolver
    }

    /// Invalidation function to hand to a [`super::MappingStore`].
    pub fn invalidation_hook(&self) -> InvalidateFn {
        let cache = Arc::clone(self.resolver.cache());
        Arc::new(move |tenant: &TenantId| cache.invalidate_tenant(tenant))
    }

    /// Post `request` through `tx`.
    ///
    /// Nothing is committed here; the returned events must be appended to the
    /// outbox in the same transaction.
    pub async fn post_in(
        &self,
        tx: &mut TenantTx<'_>,
        request: PostingRequest,
    ) -> Result<WorkOutput<PostingOutcome>, CommandError> {
        request.validate()?;

        if request.exempt {
            return skipped(&request, SkipReason::Exempt);
        }
        if let Some(existing) =
            find_source_entry(tx, &request.source_module, &request.source_reference_id).await?
        {
            return Err(CommandError::conflict(format!(
                "{}/{} already recorded as entry {existing}",
                request.source_module, request.source_reference_id
            )));
        }
        if request.lines.iter().all(is_zero) {
            return skipped(&request, SkipReason::ZeroAmount);
        }

        let mut unmapped = Vec::new();
        let builder = self.map_lines(tx, &request, &mut unmapped).await?;
        if builder.is_empty() {
            return skipped(&request, SkipReason::ZeroAmount);
        }
        let lines = builder.build()?;

        let period_id = ensure_period_open(tx, request.business_date).await?;
        let journal_number = next_journal_number(tx).await?;
        let entry = new_entry(tx.tenant(), &request, period_id, lines, Some(journal_number));

        insert_entry(tx, &entry).await?;
        apply_balances(tx, &entry.period_id, &entry.lines).await?;
        record_unmapped(tx, &source_ref(&request), &unmapped).await?;

        info!(
            tenant_id = %entry.tenant_id,
            entry_id = %entry.id,
            journal_number,
            source_module = %entry.source_module,
            source_reference_id = %entry.source_reference_id,
            total_cents = entry.total_debit_cents,
            "Journal entry posted"
        );

        let event = posted_event(&entry, journal_number, &unmapped)?;
        Ok(WorkOutput::new(
            PostingOutcome::Posted {
                entry_id: entry.id,
                journal_number,
                period_id: entry.period_id,
                total_cents: entry.total_debit_cents,
                unmapped,
            },
            vec![event],
        ))
    }

    /// Post `request` in its own transaction.
    pub async fn post(
        &self,
        tenant: TenantId,
        request: PostingRequest,
    ) -> Result<PostingOutcome, CommandError> {
        self.publisher
            .publish(tenant, PostWork { engine: self, request })
            .await
    }

    /// Post `request` at most once per idempotency key.
    pub async fn post_idempotent(
        &self,
        tenant: TenantId,
        key: IdempotencyKey,
        request: PostingRequest,
    ) -> Result<CommandOutcome<PostingOutcome>, CommandError> {
        self.publisher
            .publish_idempotent(tenant, key, PostWork { engine: self, request })
            .await
    }

    /// Record a balanced entry without numbering it or touching balances.
    pub async fn create_draft(
        &self,
        tenant: TenantId,
        request: PostingRequest,
    ) -> Result<JournalEntry, CommandError> {
        self.publisher
            .publish(tenant, DraftWork { engine: self, request })
            .await
    }

    /// Number and post a draft entry.
    pub async fn post_draft(
        &self,
        tenant: TenantId,
        entry_id: Uuid,
    ) -> Result<PostingOutcome, CommandError> {
        self.publisher.publish(tenant, PostDraftWork { entry_id }).await
    }

    /// Void a posted entry by posting its reversal on `business_date`.
    pub async fn void_entry(
        &self,
        tenant: TenantId,
        entry_id: Uuid,
        business_date: NaiveDate,
        reason: &str,
    ) -> Result<VoidOutcome, CommandError> {
        if reason.trim().is_empty() {
            return Err(CommandError::validation("void reason is required"));
        }
        self.publisher
            .publish(
                tenant,
                VoidWork {
                    entry_id,
                    business_date,
                    reason: reason.to_string(),
                },
            )
            .await
    }

    pub async fn get_entry(
        &self,
        tenant: TenantId,
        entry_id: Uuid,
    ) -> Result<Option<JournalEntry>, CommandError> {
        let mut tx = TenantTx::begin(&self.pool, tenant).await?;
        let entry = load_entry(&mut tx, entry_id).await?;
        tx.rollback().await?;
        Ok(entry)
    }

    /// Running totals of `account_id`, for one period or across all of them.
    pub async fn account_balance(
        &self,
        tenant: TenantId,
        account_id: &str,
        period_id: Option<&str>,
    ) -> Result<AccountBalance, CommandError> {
        // Statements are rendered before the first await.
        let sql = {
            let mut select = Query::select();
            select
                .expr_as(
                    Expr::cust("COALESCE(SUM(debit_cents), 0)"),
                    Alias::new("debit_cents"),
                )
                .expr_as(
                    Expr::cust("COALESCE(SUM(credit_cents), 0)"),
                    Alias::new("credit_cents"),
                )
                .from(GlAccountBalances::Table)
                .and_where(Expr::col(GlAccountBalances::TenantId).eq(tenant.as_str()))
                .and_where(Expr::col(GlAccountBalances::AccountId).eq(account_id));
            if let Some(period_id) = period_id {
                select.and_where(Expr::col(GlAccountBalances::PeriodId).eq(period_id));
            }
            select.to_string(SqliteQueryBuilder)
        };

        let mut tx = TenantTx::begin(&self.pool, tenant).await?;
        let row = tx.fetch_optional(&sql).await?;
        tx.rollback().await?;

        Ok(match row {
            Some(row) => AccountBalance {
                debit_cents: row.try_get("debit_cents")?,
                credit_cents: row.try_get("credit_cents")?,
            },
            None => AccountBalance::default(),
        })
    }

    async fn map_lines(
        &self,
        tx: &mut TenantTx<'_>,
        request: &PostingRequest,
        unmapped: &mut Vec<UnmappedMapping>,
    ) -> Result<LineBuilder, CommandError> {
        let undimensioned = Dimensions::default();
        let mut builder = LineBuilder::new();

        for line in request.lines.iter().filter(|line| !is_zero(line)) {
            match line {
                SourceLine::Revenue {
                    sub_department_id,
                    amount_cents,
                    dimensions,
                } => {
                    let revenue = self
                        .resolver
                        .resolve(tx, MappingKind::SubDepartmentRevenue, sub_department_id, unmapped)
                        .await?;
                    builder.add(&revenue, Side::Credit, *amount_cents, dimensions, None)?;
                }
                SourceLine::CostOfGoods {
                    sub_department_id,
                    amount_cents,
                    dimensions,
                } => {
                    let cogs = self
                        .resolver
                        .resolve(tx, MappingKind::SubDepartmentCogs, sub_department_id, unmapped)
                        .await?;
                    let inventory = self
                        .resolver
                        .resolve(tx, MappingKind::SubDepartmentInventory, sub_department_id, unmapped)
                        .await?;
                    builder.add(&cogs, Side::Debit, *amount_cents, dimensions, None)?;
                    builder.add(&inventory, Side::Credit, *amount_cents, dimensions, None)?;
                }
                SourceLine::Tender {
                    payment_type,
                    amount_cents,
                    fee_cents,
                } => {
                    let clearing = self
                        .resolver
                        .resolve(tx, MappingKind::PaymentTypeClearing, payment_type, unmapped)
                        .await?;
                    let net = amount_cents
                        .checked_sub(*fee_cents)
                        .ok_or_else(|| CommandError::validation("tender amount out of range"))?;
                    builder.add(&clearing, Side::Debit, net, &undimensioned, None)?;
                    if *fee_cents != 0 {
                        let fee = self
                            .resolver
                            .resolve(tx, MappingKind::PaymentTypeFee, payment_type, unmapped)
                            .await?;
                        builder.add(&fee, Side::Debit, *fee_cents, &undimensioned, None)?;
                    }
                }
                SourceLine::Tax {
                    tax_group_id,
                    amount_cents,
                } => {
                    let payable = self
                        .resolver
                        .resolve(tx, MappingKind::TaxGroupPayable, tax_group_id, unmapped)
                        .await?;
                    builder.add(&payable, Side::Credit, *amount_cents, &undimensioned, None)?;
                }
                SourceLine::Account {
                    account_id,
                    side,
                    amount_cents,
                    dimensions,
                    memo,
                } => {
                    builder.add(account_id, *side, *amount_cents, dimensions, memo.as_deref())?;
                }
            }
        }
        Ok(builder)
    }

    async fn draft_in(
        &self,
        tx: &mut TenantTx<'_>,
        request: PostingRequest,
    ) -> Result<JournalEntry, CommandError> {
        request.validate()?;
        if let Some(existing) =
            find_source_entry(tx, &request.source_module, &request.source_reference_id).await?
        {
            return Err(CommandError::conflict(format!(
                "{}/{} already recorded as entry {existing}",
                request.source_module, request.source_reference_id
            )));
        }

        let mut unmapped = Vec::new();
        let builder = self.map_lines(tx, &request, &mut unmapped).await?;
        if builder.is_empty() {
            return Err(CommandError::validation("draft has no non-zero lines"));
        }
        let lines = builder.build()?;
        let period_id = ensure_period_open(tx, request.business_date).await?;

        let entry = new_entry(tx.tenant(), &request, period_id, lines, None);
        insert_entry(tx, &entry).await?;
        record_unmapped(tx, &source_ref(&request), &unmapped).await?;
        debug!(tenant_id = %entry.tenant_id, entry_id = %entry.id, "Draft entry created");
        Ok(entry)
    }
}

struct PostWork<'a> {
    engine: &'a GlPostingEngine,
    request: PostingRequest,
}

#[async_trait]
impl UnitOfWork for PostWork<'_> {
    type Output = PostingOutcome;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<PostingOutcome>, CommandError> {
        self.engine.post_in(tx, self.request).await
    }
}

struct DraftWork<'a> {
    engine: &'a GlPostingEngine,
    request: PostingRequest,
}

#[async_trait]
impl UnitOfWork for DraftWork<'_> {
    type Output = JournalEntry;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<JournalEntry>, CommandError> {
        let entry = self.engine.draft_in(tx, self.request).await?;
        Ok(WorkOutput::without_events(entry))
    }
}

struct PostDraftWork {
    entry_id: Uuid,
}

#[async_trait]
impl UnitOfWork for PostDraftWork {
    type Output = PostingOutcome;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<PostingOutcome>, CommandError> {
        let mut entry = load_entry(tx, self.entry_id).await?.ok_or_else(|| {
            CommandError::precondition(codes::ENTRY_NOT_FOUND, format!("entry {} not found", self.entry_id))
        })?;
        if entry.status != EntryStatus::Draft {
            return Err(CommandError::precondition(
                codes::ENTRY_NOT_DRAFT,
                format!("entry {} is {}", entry.id, entry.status),
            ));
        }

        ensure_period_open(tx, entry.business_date).await?;
        let journal_number = next_journal_number(tx).await?;

        let update = Query::update()
            .table(JournalEntries::Table)
            .value(JournalEntries::Status, EntryStatus::Posted.as_str())
            .value(JournalEntries::JournalNumber, journal_number)
            .value(JournalEntries::PostedAt, now_rfc3339())
            .and_where(Expr::col(JournalEntries::TenantId).eq(tx.tenant().as_str()))
            .and_where(Expr::col(JournalEntries::Id).eq(entry.id.to_string()))
            .and_where(Expr::col(JournalEntries::Status).eq(EntryStatus::Draft.as_str()))
            .to_string(SqliteQueryBuilder);
        if tx.execute(&update).await?.rows_affected() != 1 {
            return Err(CommandError::conflict(format!("entry {} changed concurrently", entry.id)));
        }
        apply_balances(tx, &entry.period_id, &entry.lines).await?;

        entry.status = EntryStatus::Posted;
        entry.journal_number = Some(journal_number);
        info!(tenant_id = %entry.tenant_id, entry_id = %entry.id, journal_number, "Draft entry posted");

        let event = posted_event(&entry, journal_number, &[])?;
        Ok(WorkOutput::new(
            PostingOutcome::Posted {
                entry_id: entry.id,
                journal_number,
                period_id: entry.period_id,
                total_cents: entry.total_debit_cents,
                unmapped: Vec::new(),
            },
            vec![event],
        ))
    }
}

struct VoidWork {
    entry_id: Uuid,
    business_date: NaiveDate,
    reason: String,
}

#[async_trait]
impl UnitOfWork for VoidWork {
    type Output = VoidOutcome;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<VoidOutcome>, CommandError> {
        let original = load_entry(tx, self.entry_id).await?.ok_or_else(|| {
            CommandError::precondition(codes::ENTRY_NOT_FOUND, format!("entry {} not found", self.entry_id))
        })?;
        if original.status != EntryStatus::Posted {
            return Err(CommandError::precondition(
                codes::ENTRY_NOT_POSTED,
                format!("entry {} is {}", original.id, original.status),
            ));
        }

        let period_id = ensure_period_open(tx, self.business_date).await?;
        let journal_number = next_journal_number(tx).await?;
        let memo = match original.journal_number {
            Some(number) => format!("Void of #{number}: {}", self.reason),
            None => format!("Void of {}: {}", original.id, self.reason),
        };

        let reversal = JournalEntry {
            id: Uuid::new_v4(),
            tenant_id: tx.tenant().clone(),
            journal_number: Some(journal_number),
            period_id,
            business_date: self.business_date,
            status: EntryStatus::Posted,
            source_module: original.source_module.clone(),
            source_reference_id: original.source_reference_id.clone(),
            memo: Some(memo),
            reverses_entry_id: Some(original.id),
            reversed_by_entry_id: None,
            total_debit_cents: original.total_credit_cents,
            total_credit_cents: original.total_debit_cents,
            lines: reverse_lines(&original.lines),
        };
        insert_entry(tx, &reversal).await?;
        apply_balances(tx, &reversal.period_id, &reversal.lines).await?;

        let update = Query::update()
            .table(JournalEntries::Table)
            .value(JournalEntries::Status, EntryStatus::Voided.as_str())
            .value(JournalEntries::ReversedByEntryId, reversal.id.to_string())
            .value(JournalEntries::VoidedAt, now_rfc3339())
            .and_where(Expr::col(JournalEntries::TenantId).eq(tx.tenant().as_str()))
            .and_where(Expr::col(JournalEntries::Id).eq(original.id.to_string()))
            .and_where(Expr::col(JournalEntries::Status).eq(EntryStatus::Posted.as_str()))
            .to_string(SqliteQueryBuilder);
        if tx.execute(&update).await?.rows_affected() != 1 {
            return Err(CommandError::conflict(format!(
                "entry {} changed concurrently",
                original.id
            )));
        }

        info!(
            tenant_id = %reversal.tenant_id,
            entry_id = %original.id,
            reversal_entry_id = %reversal.id,
            reason = %self.reason,
            "Journal entry voided"
        );

        let event = NewEvent::new(
            types::JOURNAL_VOIDED,
            JournalVoided {
                entry_id: original.id,
                journal_number: original.journal_number,
                reversal_entry_id: reversal.id,
                reversal_journal_number: journal_number,
                period_id: &reversal.period_id,
                reason: &self.reason,
            },
        )?;
        Ok(WorkOutput::new(
            VoidOutcome {
                entry_id: original.id,
                reversal_entry_id: reversal.id,
                reversal_journal_number: journal_number,
                period_id: reversal.period_id,
            },
            vec![event],
        ))
    }
}

fn source_ref(request: &PostingRequest) -> SourceRef<'_> {
    SourceRef {
        module: &request.source_module,
        reference_id: &request.source_reference_id,
        business_date: request.business_date,
    }
}

fn is_zero(line: &SourceLine) -> bool {
    match line {
        SourceLine::Tender {
            amount_cents,
            fee_cents,
            ..
        } => *amount_cents == 0 && *fee_cents == 0,
        SourceLine::Revenue { amount_cents, .. }
        | SourceLine::CostOfGoods { amount_cents, .. }
        | SourceLine::Tax { amount_cents, .. }
        | SourceLine::Account { amount_cents, .. } => *amount_cents == 0,
    }
}

fn skipped(
    request: &PostingRequest,
    reason: SkipReason,
) -> Result<WorkOutput<PostingOutcome>, CommandError> {
    debug!(
        source_module = %request.source_module,
        source_reference_id = %request.source_reference_id,
        ?reason,
        "Posting skipped"
    );
    let event = NewEvent::new(
        types::POSTING_SKIPPED,
        PostingSkipped {
            source_module: &request.source_module,
            source_reference_id: &request.source_reference_id,
            business_date: request.business_date,
            reason,
        },
    )?;
    Ok(WorkOutput::new(PostingOutcome::Skipped { reason }, vec![event]))
}

fn posted_event(
    entry: &JournalEntry,
    journal_number: i64,
    unmapped: &[UnmappedMapping],
) -> Result<NewEvent, CommandError> {
    NewEvent::new(
        types::JOURNAL_POSTED,
        JournalPosted {
            entry_id: entry.id,
            journal_number,
            period_id: &entry.period_id,
            business_date: entry.business_date,
            source_module: &entry.source_module,
            source_reference_id: &entry.source_reference_id,
            total_cents: entry.total_debit_cents,
            lines: &entry.lines,
            unmapped,
        },
    )
}

fn new_entry(
    tenant: &TenantId,
    request: &PostingRequest,
    period_id: String,
    lines: Vec<JournalLine>,
    journal_number: Option<i64>,
) -> JournalEntry {
    let total_debit_cents = lines.iter().map(|l| l.debit_cents).sum();
    let total_credit_cents = lines.iter().map(|l| l.credit_cents).sum();
    JournalEntry {
        id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        journal_number,
        period_id,
        business_date: request.business_date,
        status: if journal_number.is_some() {
            EntryStatus::Posted
        } else {
            EntryStatus::Draft
        },
        source_module: request.source_module.clone(),
        source_reference_id: request.source_reference_id.clone(),
        memo: request.memo.clone(),
        reverses_entry_id: None,
        reversed_by_entry_id: None,
        total_debit_cents,
        total_credit_cents,
        lines,
    }
}

/// Period of `date`, failing when it is closed.
pub(crate) async fn ensure_period_open(
    tx: &mut TenantTx<'_>,
    date: NaiveDate,
) -> Result<String, CommandError> {
    let period_id = period_id_for(date);
    if load_period_status(tx, &period_id).await? == PeriodStatus::Closed {
        return Err(CommandError::precondition(
            codes::PERIOD_CLOSED,
            format!("period {period_id} is closed"),
        ));
    }
    Ok(period_id)
}

async fn next_journal_number(tx: &mut TenantTx<'_>) -> Result<i64, StorageError> {
    let tenant = tx.tenant().to_string();
    let row = sqlx::query(NEXT_NUMBER_SQL)
        .bind(tenant)
        .fetch_one(tx.conn())
        .await?;
    Ok(row.try_get("last_number")?)
}

/// Id of the non-reversal entry recorded for a source document, in any status.
pub(crate) async fn find_source_entry(
    tx: &mut TenantTx<'_>,
    source_module: &str,
    source_reference_id: &str,
) -> Result<Option<Uuid>, StorageError> {
    let select = Query::select()
        .column(JournalEntries::Id)
        .from(JournalEntries::Table)
        .and_where(Expr::col(JournalEntries::TenantId).eq(tx.tenant().as_str()))
        .and_where(Expr::col(JournalEntries::SourceModule).eq(source_module))
        .and_where(Expr::col(JournalEntries::SourceReferenceId).eq(source_reference_id))
        .and_where(Expr::col(JournalEntries::ReversesEntryId).is_null())
        .to_string(SqliteQueryBuilder);

    match tx.fetch_optional(&select).await? {
        Some(row) => {
            let id: String = row.try_get("id")?;
            Ok(Some(parse_uuid("id", &id)?))
        }
        None => Ok(None),
    }
}

async fn insert_entry(tx: &mut TenantTx<'_>, entry: &JournalEntry) -> Result<(), StorageError> {
    let now = now_rfc3339();
    let posted_at = (entry.status == EntryStatus::Posted).then(|| now.clone());
    let insert = Query::insert()
        .into_table(JournalEntries::Table)
        .columns([
            JournalEntries::Id,
            JournalEntries::TenantId,
            JournalEntries::JournalNumber,
            JournalEntries::PeriodId,
            JournalEntries::BusinessDate,
            JournalEntries::Status,
            JournalEntries::SourceModule,
            JournalEntries::SourceReferenceId,
            JournalEntries::Memo,
            JournalEntries::ReversesEntryId,
            JournalEntries::TotalDebitCents,
            JournalEntries::TotalCreditCents,
            JournalEntries::CreatedAt,
            JournalEntries::PostedAt,
        ])
        .values_panic([
            entry.id.to_string().into(),
            entry.tenant_id.as_str().into(),
            entry.journal_number.into(),
            entry.period_id.as_str().into(),
            entry.business_date.to_string().into(),
            entry.status.as_str().into(),
            entry.source_module.as_str().into(),
            entry.source_reference_id.as_str().into(),
            entry.memo.clone().into(),
            entry.reverses_entry_id.map(|id| id.to_string()).into(),
            entry.total_debit_cents.into(),
            entry.total_credit_cents.into(),
            now.into(),
            posted_at.into(),
        ])
        .to_string(SqliteQueryBuilder);
    tx.execute(&insert).await?;

    let lines = {
        let mut lines = Query::insert();
        lines.into_table(JournalLines::Table).columns([
            JournalLines::EntryId,
            JournalLines::TenantId,
            JournalLines::LineNumber,
            JournalLines::AccountId,
            JournalLines::DebitCents,
            JournalLines::CreditCents,
            JournalLines::LocationId,
            JournalLines::DepartmentId,
            JournalLines::Memo,
        ]);
        for line in &entry.lines {
            lines.values_panic([
                entry.id.to_string().into(),
                entry.tenant_id.as_str().into(),
                line.line_number.into(),
                line.account_id.as_str().into(),
                line.debit_cents.into(),
                line.credit_cents.into(),
                line.dimensions.location_id.clone().into(),
                line.dimensions.department_id.clone().into(),
                line.memo.clone().into(),
            ]);
        }
        lines.to_string(SqliteQueryBuilder)
    };
    tx.execute(&lines).await?;
    Ok(())
}

async fn apply_balances(
    tx: &mut TenantTx<'_>,
    period_id: &str,
    lines: &[JournalLine],
) -> Result<(), StorageError> {
    let tenant = tx.tenant().to_string();
    for line in lines {
        sqlx::query(APPLY_BALANCE_SQL)
            .bind(&tenant)
            .bind(&line.account_id)
            .bind(period_id)
            .bind(line.debit_cents)
            .bind(line.credit_cents)
            .execute(tx.conn())
            .await?;
    }
    Ok(())
}

/// Load an entry of the transaction's tenant with its lines.
pub(crate) async fn load_entry(
    tx: &mut TenantTx<'_>,
    entry_id: Uuid,
) -> Result<Option<JournalEntry>, StorageError> {
    let tenant = tx.tenant().clone();
    let select = Query::select()
        .columns([
            JournalEntries::Id,
            JournalEntries::JournalNumber,
            JournalEntries::PeriodId,
            JournalEntries::BusinessDate,
            JournalEntries::Status,
            JournalEntries::SourceModule,
            JournalEntries::SourceReferenceId,
            JournalEntries::Memo,
            JournalEntries::ReversesEntryId,
            JournalEntries::ReversedByEntryId,
            JournalEntries::TotalDebitCents,
            JournalEntries::TotalCreditCents,
        ])
        .from(JournalEntries::Table)
        .and_where(Expr::col(JournalEntries::TenantId).eq(tenant.as_str()))
        .and_where(Expr::col(JournalEntries::Id).eq(entry_id.to_string()))
        .to_string(SqliteQueryBuilder);

    let Some(row) = tx.fetch_optional(&select).await? else {
        return Ok(None);
    };

    let lines_select = Query::select()
        .columns([
            JournalLines::LineNumber,
            JournalLines::AccountId,
            JournalLines::DebitCents,
            JournalLines::CreditCents,
            JournalLines::LocationId,
            JournalLines::DepartmentId,
            JournalLines::Memo,
        ])
        .from(JournalLines::Table)
        .and_where(Expr::col(JournalLines::TenantId).eq(tenant.as_str()))
        .and_where(Expr::col(JournalLines::EntryId).eq(entry_id.to_string()))
        .order_by(JournalLines::LineNumber, Order::Asc)
        .to_string(SqliteQueryBuilder);

    let lines = tx
        .fetch_all(&lines_select)
        .await?
        .iter()
        .map(line_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    entry_from_row(&tenant, &row, lines).map(Some)
}

fn entry_from_row(
    tenant: &TenantId,
    row: &SqliteRow,
    lines: Vec<JournalLine>,
) -> Result<JournalEntry, StorageError> {
    let id: String = row.try_get("id")?;
    let business_date: String = row.try_get("business_date")?;
    let status: String = row.try_get("status")?;
    let reverses: Option<String> = row.try_get("reverses_entry_id")?;
    let reversed_by: Option<String> = row.try_get("reversed_by_entry_id")?;

    Ok(JournalEntry {
        id: parse_uuid("id", &id)?,
        tenant_id: tenant.clone(),
        journal_number: row.try_get("journal_number")?,
        period_id: row.try_get("period_id")?,
        business_date: NaiveDate::parse_from_str(&business_date, "%Y-%m-%d").map_err(|_| {
            StorageError::InvalidValue {
                table: "journal_entries",
                column: "business_date",
                value: business_date.clone(),
            }
        })?,
        status: EntryStatus::parse(&status)?,
        source_module: row.try_get("source_module")?,
        source_reference_id: row.try_get("source_reference_id")?,
        memo: row.try_get("memo")?,
        reverses_entry_id: reverses
            .as_deref()
            .map(|v| parse_uuid("reverses_entry_id", v))
            .transpose()?,
        reversed_by_entry_id: reversed_by
            .as_deref()
            .map(|v| parse_uuid("reversed_by_entry_id", v))
            .transpose()?,
        total_debit_cents: row.try_get("total_debit_cents")?,
        total_credit_cents: row.try_get("total_credit_cents")?,
        lines,
    })
}

fn line_from_row(row: &SqliteRow) -> Result<JournalLine, StorageError> {
    Ok(JournalLine {
        line_number: row.try_get("line_number")?,
        account_id: row.try_get("account_id")?,
        debit_cents: row.try_get("debit_cents")?,
        credit_cents: row.try_get("credit_cents")?,
        dimensions: Dimensions {
            location_id: row.try_get("location_id")?,
            department_id: row.try_get("department_id")?,
        },
        memo: row.try_get("memo")?,
    })
}

fn parse_uuid(column: &'static str, value: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(value).map_err(|_| StorageError::InvalidValue {
        table: "journal_entries",
        column,
        value: value.to_string(),
    })
}
