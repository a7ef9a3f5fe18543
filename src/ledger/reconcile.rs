//! Control-account reconciliation against a subledger.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::CommandError;
use crate::storage::{TenantId, TenantTx};

use super::mapping::account_normal_balance;
use super::NormalBalance;

const GL_TOTALS_SQL: &str = r#"
SELECT COALESCE(SUM(l.debit_cents), 0) AS debit_cents,
       COALESCE(SUM(l.credit_cents), 0) AS credit_cents
FROM journal_lines l
JOIN journal_entries e ON e.id = l.entry_id
WHERE l.tenant_id = ? AND e.tenant_id = ? AND l.account_id = ?
  AND e.status IN ('posted', 'voided')
  AND e.business_date >= ? AND e.business_date <= ?
"#;

/// Inclusive range of business dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, CommandError> {
        if from > to {
            return Err(CommandError::validation(format!(
                "date range starts after it ends: {from} > {to}"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

/// The operational records a control account summarises.
#[async_trait]
pub trait SubledgerSource: Send + Sync {
    fn name(&self) -> &str;

    /// Subledger balance in cents for business dates in `range`, on the
    /// control account's normal side.
    async fn balance_cents(
        &self,
        tx: &mut TenantTx<'_>,
        range: &DateRange,
    ) -> Result<i64, CommandError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub control_account_id: String,
    pub gl_balance: Decimal,
    pub subledger_balance: Decimal,
    /// GL minus subledger.
    pub difference: Decimal,
    pub is_reconciled: bool,
}

pub struct Reconciler {
    pool: SqlitePool,
    tolerance: Decimal,
}

impl Reconciler {
    pub fn new(pool: SqlitePool, tolerance: Decimal) -> Self {
        Self { pool, tolerance }
    }

    /// Compare the control account's GL balance with `subledger` over `range`.
    ///
    /// A difference is reported, not raised.
    pub async fn reconcile(
        &self,
        tenant: TenantId,
        control_account_id: &str,
        range: &DateRange,
        subledger: &dyn SubledgerSource,
    ) -> Result<ReconciliationReport, CommandError> {
        let mut tx = TenantTx::begin(&self.pool, tenant).await?;

        let normal = account_normal_balance(&mut tx, control_account_id)
            .await?
            .ok_or_else(|| {
                CommandError::validation(format!("unknown control account '{control_account_id}'"))
            })?;

        let gl_cents = gl_balance_cents(&mut tx, control_account_id, normal, range).await?;
        let subledger_cents = subledger.balance_cents(&mut tx, range).await?;
        let tenant = tx.tenant().clone();
        tx.rollback().await?;

        let gl_balance = Decimal::new(gl_cents, 2);
        let subledger_balance = Decimal::new(subledger_cents, 2);
        let difference = gl_balance - subledger_balance;
        let is_reconciled = difference.abs() < self.tolerance;

        if is_reconciled {
            info!(
                tenant_id = %tenant,
                control_account_id,
                subledger = subledger.name(),
                %gl_balance,
                "Control account reconciled"
            );
        } else {
            warn!(
                tenant_id = %tenant,
                control_account_id,
                subledger = subledger.name(),
                %gl_balance,
                %subledger_balance,
                %difference,
                "Control account out of balance"
            );
        }

        Ok(ReconciliationReport {
            control_account_id: control_account_id.to_string(),
            gl_balance,
            subledger_balance,
            difference,
            is_reconciled,
        })
    }
}

/// Balance of `account_id` over non-draft entries dated in `range`.
///
/// Voided entries still count: their reversal carries the offset.
async fn gl_balance_cents(
    tx: &mut TenantTx<'_>,
    account_id: &str,
    normal: NormalBalance,
    range: &DateRange,
) -> Result<i64, CommandError> {
    let tenant = tx.tenant().to_string();
    let row = sqlx::query(GL_TOTALS_SQL)
        .bind(&tenant)
        .bind(&tenant)
        .bind(account_id)
        .bind(range.from.to_string())
        .bind(range.to.to_string())
        .fetch_one(tx.conn())
        .await?;

    let debit: i64 = row.try_get("debit_cents")?;
    let credit: i64 = row.try_get("credit_cents")?;
    Ok(match normal {
        NormalBalance::Debit => debit - credit,
        NormalBalance::Credit => credit - debit,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::{GlAccount, GlPostingEngine, MappingStore, PostingRequest, Side, SourceLine};
    use crate::storage::init_schema;

    struct Fixed(i64);

    #[async_trait]
    impl SubledgerSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn balance_cents(
            &self,
            _tx: &mut TenantTx<'_>,
            _range: &DateRange,
        ) -> Result<i64, CommandError> {
            Ok(self.0)
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    async fn setup() -> (SqlitePool, GlPostingEngine) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();

        let engine = GlPostingEngine::new(pool.clone(), &LedgerConfig::default());
        let store = MappingStore::new(pool.clone(), Arc::new(|_: &TenantId| {}));
        store
            .upsert_account(
                &TenantId::from("t1"),
                &GlAccount {
                    account_id: "1100".to_string(),
                    name: "Card clearing".to_string(),
                    normal_balance: NormalBalance::Debit,
                },
            )
            .await
            .unwrap();

        for (reference, date, amount) in [("a", day(3), 1000), ("b", day(20), 500), ("c", day(30), 70)] {
            let request = PostingRequest::new(
                "manual",
                reference,
                date,
                vec![
                    SourceLine::Account {
                        account_id: "1100".to_string(),
                        side: Side::Debit,
                        amount_cents: amount,
                        dimensions: Default::default(),
                        memo: None,
                    },
                    SourceLine::Account {
                        account_id: "4000".to_string(),
                        side: Side::Credit,
                        amount_cents: amount,
                        dimensions: Default::default(),
                        memo: None,
                    },
                ],
            );
            engine.post(TenantId::from("t1"), request).await.unwrap();
        }
        (pool, engine)
    }

    #[tokio::test]
    async fn test_matching_subledger_reconciles() {
        let (pool, _engine) = setup().await;
        let reconciler = Reconciler::new(pool, LedgerConfig::default().reconciliation_tolerance);
        let range = DateRange::new(day(1), day(20)).unwrap();

        let report = reconciler
            .reconcile(TenantId::from("t1"), "1100", &range, &Fixed(1500))
            .await
            .unwrap();
        assert_eq!(report.gl_balance.to_string(), "15.00");
        assert_eq!(report.difference, Decimal::ZERO);
        assert!(report.is_reconciled);
    }

    #[tokio::test]
    async fn test_one_cent_off_is_not_reconciled() {
        let (pool, _engine) = setup().await;
        let reconciler = Reconciler::new(pool, LedgerConfig::default().reconciliation_tolerance);
        let range = DateRange::new(day(1), day(30)).unwrap();

        let report = reconciler
            .reconcile(TenantId::from("t1"), "1100", &range, &Fixed(1569))
            .await
            .unwrap();
        assert_eq!(report.difference.to_string(), "0.01");
        assert!(!report.is_reconciled);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["controlAccountId"], "1100");
        assert_eq!(json["isReconciled"], false);
    }

    #[tokio::test]
    async fn test_voided_entry_nets_to_zero() {
        let (pool, engine) = setup().await;
        let posted = engine
            .post(
                TenantId::from("t1"),
                PostingRequest::new(
                    "manual",
                    "d",
                    day(10),
                    vec![
                        SourceLine::Account {
                            account_id: "1100".to_string(),
                            side: Side::Debit,
                            amount_cents: 900,
                            dimensions: Default::default(),
                            memo: None,
                        },
                        SourceLine::Account {
                            account_id: "4000".to_string(),
                            side: Side::Credit,
                            amount_cents: 900,
                            dimensions: Default::default(),
                            memo: None,
                        },
                    ],
                ),
            )
            .await
            .unwrap();
        engine
            .void_entry(TenantId::from("t1"), posted.entry_id().unwrap(), day(11), "duplicate")
            .await
            .unwrap();

        let reconciler = Reconciler::new(pool, LedgerConfig::default().reconciliation_tolerance);
        let range = DateRange::new(day(1), day(20)).unwrap();
        let report = reconciler
            .reconcile(TenantId::from("t1"), "1100", &range, &Fixed(1500))
            .await
            .unwrap();
        assert!(report.is_reconciled);
    }

    #[tokio::test]
    async fn test_unknown_control_account_is_validation() {
        let (pool, _engine) = setup().await;
        let reconciler = Reconciler::new(pool, LedgerConfig::default().reconciliation_tolerance);
        let range = DateRange::new(day(1), day(30)).unwrap();

        let err = reconciler
            .reconcile(TenantId::from("t1"), "4000", &range, &Fixed(0))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let range = DateRange::new(day(1), day(30)).unwrap();
        assert!(range.contains(day(1)));
        assert!(range.contains(day(30)));
        assert!(DateRange::new(day(2), day(1)).is_err());
    }
}
