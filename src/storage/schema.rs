//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building,
//! plus the DDL executed by [`super::init_schema`].

use sea_query::Iden;

/// Outbox table schema.
#[derive(Iden)]
pub enum OutboxEntries {
    Table,
    Position,
    EventId,
    EventType,
    TenantId,
    OccurredAt,
    Payload,
    Status,
    Attempts,
    LastError,
    NextAttemptAt,
    LockedBy,
    LockedUntil,
    DispatchedAt,
}

/// Idempotency records.
#[derive(Iden)]
pub enum IdempotencyKeys {
    Table,
    TenantId,
    ClientRequestId,
    CommandName,
    Status,
    Result,
    CreatedAt,
    CompletedAt,
    ExpiresAt,
}

/// Consumer-side dedup records.
#[derive(Iden)]
pub enum ProcessedEvents {
    Table,
    EventId,
    ConsumerName,
    TenantId,
    ProcessedAt,
}

/// Distributed lock rows.
#[derive(Iden)]
pub enum DistributedLocks {
    Table,
    Name,
    Holder,
    AcquiredAt,
    ExpiresAt,
    Context,
}

/// Last successful run per scheduled job.
#[derive(Iden)]
pub enum JobRuns {
    Table,
    JobName,
    LastRunAt,
}

/// Journal entry headers.
#[derive(Iden)]
pub enum JournalEntries {
    Table,
    Id,
    TenantId,
    JournalNumber,
    PeriodId,
    BusinessDate,
    Status,
    SourceModule,
    SourceReferenceId,
    Memo,
    ReversesEntryId,
    ReversedByEntryId,
    TotalDebitCents,
    TotalCreditCents,
    CreatedAt,
    PostedAt,
    VoidedAt,
}

/// Journal lines.
#[derive(Iden)]
pub enum JournalLines {
    Table,
    EntryId,
    TenantId,
    LineNumber,
    AccountId,
    DebitCents,
    CreditCents,
    LocationId,
    DepartmentId,
    Memo,
}

/// Running per-account, per-period totals.
#[derive(Iden)]
pub enum GlAccountBalances {
    Table,
    TenantId,
    AccountId,
    PeriodId,
    DebitCents,
    CreditCents,
}

/// Chart of accounts entries used for balance normalisation.
#[derive(Iden)]
pub enum GlAccounts {
    Table,
    TenantId,
    AccountId,
    Name,
    NormalBalance,
}

/// Accounting periods.
#[derive(Iden)]
pub enum AccountingPeriods {
    Table,
    TenantId,
    PeriodId,
    Status,
    ClosedAt,
    ClosedBy,
}

/// Sub-department → revenue/COGS/inventory accounts.
#[derive(Iden)]
pub enum GlSubdepartmentMappings {
    Table,
    TenantId,
    SubDepartmentId,
    RevenueAccountId,
    CogsAccountId,
    InventoryAccountId,
}

/// Payment type → cash/clearing/fee accounts.
#[derive(Iden)]
pub enum GlPaymentTypeMappings {
    Table,
    TenantId,
    PaymentType,
    CashAccountId,
    ClearingAccountId,
    FeeAccountId,
}

/// Tax group → payable account.
#[derive(Iden)]
pub enum GlTaxGroupMappings {
    Table,
    TenantId,
    TaxGroupId,
    PayableAccountId,
}

/// Per-tenant ledger settings.
#[derive(Iden)]
pub enum GlSettings {
    Table,
    TenantId,
    UnmappedAccountId,
}

/// Missing-mapping action items.
#[derive(Iden)]
pub enum GlUnmappedEvents {
    Table,
    Id,
    TenantId,
    SourceModule,
    SourceReferenceId,
    MappingKind,
    MappingKey,
    FallbackAccountId,
    BusinessDate,
    PeriodId,
    CreatedAt,
    ResolvedAt,
    ResolvedBy,
}

/// Business events the GL consumer could not post.
#[derive(Iden)]
pub enum GlUnpostedItems {
    Table,
    Id,
    TenantId,
    EventId,
    EventType,
    SourceReferenceId,
    BusinessDate,
    PeriodId,
    Reason,
    CreatedAt,
    ResolvedAt,
}

/// Payment intents (reference command aggregate).
#[derive(Iden)]
pub enum PaymentIntents {
    Table,
    Id,
    TenantId,
    Status,
    PaymentType,
    SubDepartmentId,
    AmountCents,
    CapturedAmountCents,
    RefundedAmountCents,
    CreatedAt,
    UpdatedAt,
}

/// Money movements against payment intents.
#[derive(Iden)]
pub enum PaymentTransactions {
    Table,
    Id,
    TenantId,
    IntentId,
    Kind,
    AmountCents,
    BusinessDate,
    ClientRequestId,
    CreatedAt,
}

pub const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_entries (
    position INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at INTEGER NOT NULL DEFAULT 0,
    locked_by TEXT,
    locked_until INTEGER,
    dispatched_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status_position ON outbox_entries(status, position);
CREATE INDEX IF NOT EXISTS idx_outbox_tenant_position ON outbox_entries(tenant_id, position);
"#;

pub const CREATE_IDEMPOTENCY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    tenant_id TEXT NOT NULL,
    client_request_id TEXT NOT NULL,
    command_name TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, client_request_id, command_name)
);

CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_keys(expires_at);
"#;

pub const CREATE_PROCESSED_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS processed_events (
    event_id TEXT NOT NULL,
    consumer_name TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    PRIMARY KEY (event_id, consumer_name)
);
"#;

pub const CREATE_LOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS distributed_locks (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    context TEXT
);

CREATE TABLE IF NOT EXISTS job_runs (
    job_name TEXT PRIMARY KEY,
    last_run_at INTEGER NOT NULL
);
"#;

pub const CREATE_JOURNAL_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS journal_sequences (
    tenant_id TEXT PRIMARY KEY,
    last_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS journal_entries (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    journal_number INTEGER,
    period_id TEXT NOT NULL,
    business_date TEXT NOT NULL,
    status TEXT NOT NULL,
    source_module TEXT NOT NULL,
    source_reference_id TEXT NOT NULL,
    memo TEXT,
    reverses_entry_id TEXT,
    reversed_by_entry_id TEXT,
    total_debit_cents INTEGER NOT NULL,
    total_credit_cents INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    posted_at TEXT,
    voided_at TEXT,
    CHECK (status <> 'posted' OR total_debit_cents = total_credit_cents)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_journal_number
    ON journal_entries(tenant_id, journal_number) WHERE journal_number IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_journal_source
    ON journal_entries(tenant_id, source_module, source_reference_id) WHERE reverses_entry_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_journal_period ON journal_entries(tenant_id, period_id, status);

CREATE TABLE IF NOT EXISTS journal_lines (
    entry_id TEXT NOT NULL REFERENCES journal_entries(id),
    tenant_id TEXT NOT NULL,
    line_number INTEGER NOT NULL,
    account_id TEXT NOT NULL,
    debit_cents INTEGER NOT NULL DEFAULT 0,
    credit_cents INTEGER NOT NULL DEFAULT 0,
    location_id TEXT,
    department_id TEXT,
    memo TEXT,
    PRIMARY KEY (entry_id, line_number),
    CHECK (debit_cents >= 0 AND credit_cents >= 0),
    CHECK (debit_cents = 0 OR credit_cents = 0)
);

CREATE INDEX IF NOT EXISTS idx_journal_lines_account ON journal_lines(tenant_id, account_id);

CREATE TABLE IF NOT EXISTS gl_account_balances (
    tenant_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    period_id TEXT NOT NULL,
    debit_cents INTEGER NOT NULL DEFAULT 0,
    credit_cents INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant_id, account_id, period_id)
);

CREATE TABLE IF NOT EXISTS gl_accounts (
    tenant_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    name TEXT NOT NULL,
    normal_balance TEXT NOT NULL,
    PRIMARY KEY (tenant_id, account_id)
);

CREATE TABLE IF NOT EXISTS accounting_periods (
    tenant_id TEXT NOT NULL,
    period_id TEXT NOT NULL,
    status TEXT NOT NULL,
    closed_at TEXT,
    closed_by TEXT,
    PRIMARY KEY (tenant_id, period_id)
);
"#;

pub const CREATE_MAPPING_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS gl_subdepartment_mappings (
    tenant_id TEXT NOT NULL,
    sub_department_id TEXT NOT NULL,
    revenue_account_id TEXT,
    cogs_account_id TEXT,
    inventory_account_id TEXT,
    PRIMARY KEY (tenant_id, sub_department_id)
);

CREATE TABLE IF NOT EXISTS gl_payment_type_mappings (
    tenant_id TEXT NOT NULL,
    payment_type TEXT NOT NULL,
    cash_account_id TEXT,
    clearing_account_id TEXT,
    fee_account_id TEXT,
    PRIMARY KEY (tenant_id, payment_type)
);

CREATE TABLE IF NOT EXISTS gl_tax_group_mappings (
    tenant_id TEXT NOT NULL,
    tax_group_id TEXT NOT NULL,
    payable_account_id TEXT NOT NULL,
    PRIMARY KEY (tenant_id, tax_group_id)
);

CREATE TABLE IF NOT EXISTS gl_settings (
    tenant_id TEXT PRIMARY KEY,
    unmapped_account_id TEXT
);

CREATE TABLE IF NOT EXISTS gl_unmapped_events (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    source_module TEXT NOT NULL,
    source_reference_id TEXT NOT NULL,
    mapping_kind TEXT NOT NULL,
    mapping_key TEXT NOT NULL,
    fallback_account_id TEXT NOT NULL,
    business_date TEXT NOT NULL,
    period_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    resolved_by TEXT,
    UNIQUE (tenant_id, source_module, source_reference_id, mapping_kind, mapping_key)
);

CREATE TABLE IF NOT EXISTS gl_unposted_items (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    source_reference_id TEXT NOT NULL,
    business_date TEXT NOT NULL,
    period_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
"#;

pub const CREATE_PAYMENT_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS payment_intents (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    payment_type TEXT NOT NULL,
    sub_department_id TEXT,
    amount_cents INTEGER NOT NULL,
    captured_amount_cents INTEGER NOT NULL DEFAULT 0,
    refunded_amount_cents INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (refunded_amount_cents <= captured_amount_cents)
);

CREATE TABLE IF NOT EXISTS payment_transactions (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    intent_id TEXT NOT NULL REFERENCES payment_intents(id),
    kind TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    business_date TEXT NOT NULL,
    client_request_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_payment_tx_date ON payment_transactions(tenant_id, business_date);
"#;

/// Every DDL block, in creation order.
pub const ALL_TABLES: &[&str] = &[
    CREATE_OUTBOX_TABLE,
    CREATE_IDEMPOTENCY_TABLE,
    CREATE_PROCESSED_EVENTS_TABLE,
    CREATE_LOCKS_TABLE,
    CREATE_JOURNAL_TABLES,
    CREATE_MAPPING_TABLES,
    CREATE_PAYMENT_TABLES,
];
