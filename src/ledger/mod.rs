//! Double-entry general ledger.
//!
//! Source documents (sales, refunds, manual adjustments) are described as
//! [`SourceLine`]s. The posting engine maps them to accounts, builds balanced
//! journal lines, checks the period lock, numbers the entry and records it
//! together with the events announcing it.
//!
//! Entries move `draft → posted → voided`. A posted entry is never edited; a
//! void adds a reversing entry and flips the original's status.

pub mod builder;
pub mod consumer;
pub mod mapping;
pub mod period;
pub mod posting;
pub mod reconcile;

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CommandError;
use crate::storage::{StorageError, TenantId};

pub use builder::{LineBuilder, PostingLine};
pub use consumer::{
    GlPostingConsumer, PostingTranslator, RefundCreatedTranslator, SaleCompletedTranslator,
};
pub use mapping::{
    GlAccount, InvalidateFn, MappingCache, MappingKind, MappingResolver, MappingStore, NormalBalance,
    PaymentTypeMapping, SubDepartmentMapping, TaxGroupMapping,
};
pub use period::{BlockerKind, CloseBlocker, PeriodClosed, PeriodService, PeriodStatus};
pub use posting::{GlPostingEngine, VoidOutcome};
pub use reconcile::{DateRange, ReconciliationReport, Reconciler, SubledgerSource};

/// Debit or credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Debit,
    Credit,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Debit => Side::Credit,
            Side::Credit => Side::Debit,
        }
    }
}

/// Lifecycle of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Draft,
    Posted,
    Voided,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Draft => "draft",
            EntryStatus::Posted => "posted",
            EntryStatus::Voided => "voided",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "draft" => Ok(EntryStatus::Draft),
            "posted" => Ok(EntryStatus::Posted),
            "voided" => Ok(EntryStatus::Voided),
            other => Err(StorageError::InvalidValue {
                table: "journal_entries",
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reporting dimensions carried onto journal lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimensions {
    pub location_id: Option<String>,
    pub department_id: Option<String>,
}

/// One economic fact of a source document, before account mapping.
///
/// Amounts are signed cents in the line's natural direction: a positive
/// `Revenue` credits revenue, a negative one (a refund) debits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLine {
    /// Credit the sub-department's revenue account.
    Revenue {
        sub_department_id: String,
        amount_cents: i64,
        #[serde(default)]
        dimensions: Dimensions,
    },
    /// Debit COGS and credit inventory for the sub-department.
    CostOfGoods {
        sub_department_id: String,
        amount_cents: i64,
        #[serde(default)]
        dimensions: Dimensions,
    },
    /// Debit clearing (or cash) for the net amount and the fee account for the fee.
    Tender {
        payment_type: String,
        amount_cents: i64,
        #[serde(default)]
        fee_cents: i64,
    },
    /// Credit the tax group's payable account.
    Tax { tax_group_id: String, amount_cents: i64 },
    /// Post directly to a known account.
    Account {
        account_id: String,
        side: Side,
        amount_cents: i64,
        #[serde(default)]
        dimensions: Dimensions,
        #[serde(default)]
        memo: Option<String>,
    },
}

/// A request to record one source document in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingRequest {
    pub source_module: String,
    pub source_reference_id: String,
    pub business_date: NaiveDate,
    #[serde(default)]
    pub memo: Option<String>,
    pub lines: Vec<SourceLine>,
    /// Explicitly excluded from the ledger; recorded as skipped.
    #[serde(default)]
    pub exempt: bool,
}

impl PostingRequest {
    pub fn new(
        source_module: impl Into<String>,
        source_reference_id: impl Into<String>,
        business_date: NaiveDate,
        lines: Vec<SourceLine>,
    ) -> Self {
        Self {
            source_module: source_module.into(),
            source_reference_id: source_reference_id.into(),
            business_date,
            memo: None,
            lines,
            exempt: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), CommandError> {
        if self.source_module.trim().is_empty() {
            return Err(CommandError::validation("source module is required"));
        }
        if self.source_reference_id.trim().is_empty() {
            return Err(CommandError::validation("source reference id is required"));
        }
        Ok(())
    }
}

/// Accounting period identifier (`YYYY-MM`) containing `date`.
pub fn period_id_for(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Check a period identifier is `YYYY-MM`.
pub fn parse_period_id(period_id: &str) -> Result<String, CommandError> {
    NaiveDate::parse_from_str(&format!("{period_id}-01"), "%Y-%m-%d")
        .ok()
        .filter(|date| period_id_for(*date) == period_id)
        .map(|_| period_id.to_string())
        .ok_or_else(|| CommandError::validation(format!("invalid period id '{period_id}'")))
}

/// A persisted journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalLine {
    pub line_number: i64,
    pub account_id: String,
    pub debit_cents: i64,
    pub credit_cents: i64,
    #[serde(flatten)]
    pub dimensions: Dimensions,
    pub memo: Option<String>,
}

/// A persisted journal entry with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub journal_number: Option<i64>,
    pub period_id: String,
    pub business_date: NaiveDate,
    pub status: EntryStatus,
    pub source_module: String,
    pub source_reference_id: String,
    pub memo: Option<String>,
    pub reverses_entry_id: Option<Uuid>,
    pub reversed_by_entry_id: Option<Uuid>,
    pub total_debit_cents: i64,
    pub total_credit_cents: i64,
    pub lines: Vec<JournalLine>,
}

/// Why a posting produced no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Exempt,
    ZeroAmount,
}

/// A mapping that fell back to the unmapped account during posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmappedMapping {
    pub mapping_kind: String,
    pub mapping_key: String,
    pub fallback_account_id: String,
}

/// Result of a posting attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PostingOutcome {
    Posted {
        entry_id: Uuid,
        journal_number: i64,
        period_id: String,
        total_cents: i64,
        unmapped: Vec<UnmappedMapping>,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl PostingOutcome {
    pub fn entry_id(&self) -> Option<Uuid> {
        match self {
            PostingOutcome::Posted { entry_id, .. } => Some(*entry_id),
            PostingOutcome::Skipped { .. } => None,
        }
    }
}

/// Running totals of one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub debit_cents: i64,
    pub credit_cents: i64,
}

impl AccountBalance {
    /// Balance on the account's normal side.
    pub fn net(&self, normal: NormalBalance) -> i64 {
        match normal {
            NormalBalance::Debit => self.debit_cents - self.credit_cents,
            NormalBalance::Credit => self.credit_cents - self.debit_cents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_id_for_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        assert_eq!(period_id_for(date), "2024-03");
    }

    #[test]
    fn test_parse_period_id() {
        assert_eq!(parse_period_id("2024-03").unwrap(), "2024-03");
        assert!(parse_period_id("2024-13").is_err());
        assert!(parse_period_id("2024-3").is_err());
        assert!(parse_period_id("March").is_err());
    }

    #[test]
    fn test_source_line_wire_format() {
        let line: SourceLine = serde_json::from_value(serde_json::json!({
            "kind": "tender",
            "payment_type": "card",
            "amount_cents": 1000
        }))
        .unwrap();
        assert_eq!(
            line,
            SourceLine::Tender {
                payment_type: "card".to_string(),
                amount_cents: 1000,
                fee_cents: 0,
            }
        );
    }

    #[test]
    fn test_account_balance_net_follows_normal_side() {
        let balance = AccountBalance {
            debit_cents: 500,
            credit_cents: 200,
        };
        assert_eq!(balance.net(NormalBalance::Debit), 300);
        assert_eq!(balance.net(NormalBalance::Credit), -300);
    }
}
