//! Shared helpers for integration tests.
//!
//! Single-connection in-memory pools for ordinary scenarios; a temporary
//! database file with several connections when a test needs real concurrency.
//! The file lives in its own directory, removed when the [`TempDb`] drops.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use ledgerbox::config::{Config, LedgerConfig, StorageConfig};
use ledgerbox::dispatch::Dispatcher;
use ledgerbox::events::{types, NewEvent};
use ledgerbox::ledger::{
    GlAccount, GlPostingConsumer, GlPostingEngine, MappingStore, NormalBalance, PaymentTypeMapping,
    SubDepartmentMapping,
};
use ledgerbox::storage::{init_schema, init_storage};
use ledgerbox::utils::bootstrap::build_publisher;
use ledgerbox::{CommandError, OutboxPublisher, TenantId, TenantTx, UnitOfWork, WorkOutput};

pub fn tenant() -> TenantId {
    TenantId::from("store-1")
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}

/// A database file in its own temp directory; the directory goes when this drops.
pub struct TempDb {
    pub pool: SqlitePool,
    dir: PathBuf,
}

impl TempDb {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        cleanup_dir(&self.dir);
    }
}

fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// Database file under the temp dir, shared by `max_connections` connections.
pub async fn file_pool(max_connections: u32) -> TempDb {
    let dir = std::env::temp_dir().join(format!("ledgerbox-test-{}", Uuid::new_v4()));
    let pool = init_storage(&StorageConfig {
        path: dir.join("ledgerbox.db").to_string_lossy().into_owned(),
        max_connections,
        busy_timeout_ms: 5_000,
    })
    .await
    .unwrap();
    TempDb { pool, dir }
}

/// Grocery revenue/COGS/inventory and card clearing with a processor fee account.
pub async fn seed_mappings(pool: &SqlitePool, engine: &GlPostingEngine, tenant: &TenantId) {
    let store = MappingStore::new(pool.clone(), engine.invalidation_hook());
    for (account_id, name, normal_balance) in [
        ("1100", "Card clearing", NormalBalance::Debit),
        ("1300", "Inventory", NormalBalance::Debit),
        ("4000", "Grocery sales", NormalBalance::Credit),
        ("5000", "Grocery cost of goods", NormalBalance::Debit),
        ("6100", "Card fees", NormalBalance::Debit),
    ] {
        store
            .upsert_account(
                tenant,
                &GlAccount {
                    account_id: account_id.to_string(),
                    name: name.to_string(),
                    normal_balance,
                },
            )
            .await
            .unwrap();
    }
    store
        .upsert_sub_department(
            tenant,
            &SubDepartmentMapping {
                sub_department_id: "grocery".to_string(),
                revenue_account_id: Some("4000".to_string()),
                cogs_account_id: Some("5000".to_string()),
                inventory_account_id: Some("1300".to_string()),
            },
        )
        .await
        .unwrap();
    store
        .upsert_payment_type(
            tenant,
            &PaymentTypeMapping {
                payment_type: "card".to_string(),
                cash_account_id: None,
                clearing_account_id: Some("1100".to_string()),
                fee_account_id: Some("6100".to_string()),
            },
        )
        .await
        .unwrap();
}

/// Posting engine plus a dispatcher delivering to the GL consumer.
pub struct Ledger {
    pub pool: SqlitePool,
    pub engine: Arc<GlPostingEngine>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Ledger {
    pub async fn new(pool: SqlitePool) -> Self {
        let config = Config::for_test();
        let engine = Arc::new(GlPostingEngine::new(pool.clone(), &LedgerConfig::default()));
        seed_mappings(&pool, &engine, &tenant()).await;
        let dispatcher = Arc::new(
            Dispatcher::new(pool.clone(), &config.outbox)
                .with_consumer(Arc::new(GlPostingConsumer::new(engine.clone()))),
        );
        Self {
            pool,
            engine,
            dispatcher,
        }
    }

    /// Publisher that dispatches inline through this ledger's dispatcher.
    pub fn publisher(&self) -> OutboxPublisher {
        build_publisher(&Config::for_test(), self.pool.clone(), Some(self.dispatcher.clone()))
    }

    /// Publisher that leaves events for a later dispatch pass.
    pub fn deferred_publisher(&self) -> OutboxPublisher {
        build_publisher(&Config::for_test(), self.pool.clone(), None)
    }
}

/// Stands in for the sales module: completes a sale and emits its event.
pub struct CompleteSale {
    pub sale_id: String,
    pub business_date: NaiveDate,
    pub sub_department_id: String,
    pub amount_cents: i64,
    pub cost_cents: i64,
    pub fee_cents: i64,
}

impl CompleteSale {
    pub fn grocery(sale_id: &str, business_date: NaiveDate, amount_cents: i64) -> Self {
        Self {
            sale_id: sale_id.to_string(),
            business_date,
            sub_department_id: "grocery".to_string(),
            amount_cents,
            cost_cents: 0,
            fee_cents: 0,
        }
    }
}

#[async_trait]
impl UnitOfWork for CompleteSale {
    type Output = String;

    async fn run(self, _tx: &mut TenantTx<'_>) -> Result<WorkOutput<String>, CommandError> {
        let event = NewEvent::new(
            types::SALE_COMPLETED,
            json!({
                "saleId": self.sale_id,
                "businessDate": self.business_date,
                "locationId": "loc-1",
                "lines": [{
                    "subDepartmentId": self.sub_department_id,
                    "amountCents": self.amount_cents,
                    "costCents": self.cost_cents,
                }],
                "tenders": [{
                    "paymentType": "card",
                    "amountCents": self.amount_cents,
                    "feeCents": self.fee_cents,
                }],
            }),
        )?;
        Ok(WorkOutput::new(self.sale_id, vec![event]))
    }
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}
