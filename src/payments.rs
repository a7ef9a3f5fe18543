//! Payment capture and refund commands.
//!
//! These are the reference commands of the consistency layer: each one is
//! idempotent per client request id, changes the intent with a single
//! conditional statement and publishes its event through the outbox.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::{codes, CommandError};
use crate::events::{types, NewEvent};
use crate::idempotency::IdempotencyKey;
use crate::ledger::{DateRange, SubledgerSource};
use crate::outbox::{CommandOutcome, OutboxPublisher, UnitOfWork, WorkOutput};
use crate::storage::schema::{PaymentIntents, PaymentTransactions};
use crate::storage::{now_rfc3339, StorageError, TenantId, TenantTx};

/// Command names used in idempotency keys.
pub mod commands {
    pub const CAPTURE: &str = "payments.capture";
    pub const REFUND: &str = "payments.refund";
}

const KIND_CAPTURE: &str = "capture";
const KIND_REFUND: &str = "refund";

const APPLY_REFUND_SQL: &str = r#"
UPDATE payment_intents
SET refunded_amount_cents = refunded_amount_cents + ?,
    status = CASE WHEN refunded_amount_cents + ? = captured_amount_cents THEN 'refunded' ELSE status END,
    updated_at = ?
WHERE tenant_id = ? AND id = ? AND status = 'captured'
  AND refunded_amount_cents + ? <= captured_amount_cents
RETURNING status, payment_type, sub_department_id, captured_amount_cents, refunded_amount_cents
"#;

const SUBLEDGER_SQL: &str = r#"
SELECT COALESCE(SUM(CASE t.kind WHEN 'capture' THEN t.amount_cents ELSE -t.amount_cents END), 0) AS balance
FROM payment_transactions t
JOIN payment_intents i ON i.id = t.intent_id
WHERE t.tenant_id = ? AND i.tenant_id = ?
  AND t.business_date >= ? AND t.business_date <= ?
  AND (? IS NULL OR i.payment_type = ?)
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Captured,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Captured => "captured",
            PaymentStatus::Refunded => "refunded",
        }
    }

    fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "captured" => Ok(PaymentStatus::Captured),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(StorageError::InvalidValue {
                table: "payment_intents",
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturePayment {
    pub payment_type: String,
    pub amount_cents: i64,
    #[serde(default)]
    pub sub_department_id: Option<String>,
    pub business_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub payment_intent_id: Uuid,
    pub status: PaymentStatus,
    pub captured_amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundPayment {
    pub payment_intent_id: Uuid,
    pub amount_cents: i64,
    pub business_date: NaiveDate,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub payment_intent_id: Uuid,
    pub refund_id: Uuid,
    pub status: PaymentStatus,
    pub captured_amount_cents: i64,
    pub refunded_amount_cents: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentCaptured<'a> {
    payment_intent_id: Uuid,
    amount_cents: i64,
    payment_type: &'a str,
    sub_department_id: Option<&'a str>,
    business_date: NaiveDate,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefundCreated<'a> {
    payment_intent_id: Uuid,
    refund_id: Uuid,
    amount_cents: i64,
    payment_type: &'a str,
    sub_department_id: Option<&'a str>,
    business_date: NaiveDate,
    reason: Option<&'a str>,
}

#[derive(Clone)]
pub struct PaymentService {
    publisher: OutboxPublisher,
}

impl PaymentService {
    pub fn new(publisher: OutboxPublisher) -> Self {
        Self { publisher }
    }

    /// Record a captured payment.
    pub async fn capture(
        &self,
        tenant: TenantId,
        client_request_id: &str,
        command: CapturePayment,
    ) -> Result<CommandOutcome<CaptureResult>, CommandError> {
        let key = IdempotencyKey::new(client_request_id, commands::CAPTURE)?;
        self.publisher
            .publish_idempotent(
                tenant,
                key,
                Capture {
                    client_request_id: client_request_id.to_string(),
                    command,
                },
            )
            .await
    }

    /// Refund part or all of a captured payment.
    pub async fn refund(
        &self,
        tenant: TenantId,
        client_request_id: &str,
        command: RefundPayment,
    ) -> Result<CommandOutcome<RefundResult>, CommandError> {
        let key = IdempotencyKey::new(client_request_id, commands::REFUND)?;
        self.publisher
            .publish_idempotent(
                tenant,
                key,
                Refund {
                    client_request_id: client_request_id.to_string(),
                    command,
                },
            )
            .await
    }
}

struct Capture {
    client_request_id: String,
    command: CapturePayment,
}

#[async_trait]
impl UnitOfWork for Capture {
    type Output = CaptureResult;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<CaptureResult>, CommandError> {
        let command = self.command;
        if command.amount_cents <= 0 {
            return Err(CommandError::validation("capture amount must be positive"));
        }
        if command.payment_type.trim().is_empty() {
            return Err(CommandError::validation("payment type is required"));
        }

        let intent_id = Uuid::new_v4();
        let now = now_rfc3339();
        let insert = Query::insert()
            .into_table(PaymentIntents::Table)
            .columns([
                PaymentIntents::Id,
                PaymentIntents::TenantId,
                PaymentIntents::Status,
                PaymentIntents::PaymentType,
                PaymentIntents::SubDepartmentId,
                PaymentIntents::AmountCents,
                PaymentIntents::CapturedAmountCents,
                PaymentIntents::CreatedAt,
                PaymentIntents::UpdatedAt,
            ])
            .values_panic([
                intent_id.to_string().into(),
                tx.tenant().as_str().into(),
                PaymentStatus::Captured.as_str().into(),
                command.payment_type.as_str().into(),
                command.sub_department_id.clone().into(),
                command.amount_cents.into(),
                command.amount_cents.into(),
                now.as_str().into(),
                now.as_str().into(),
            ])
            .to_string(SqliteQueryBuilder);
        tx.execute(&insert).await?;

        insert_transaction(
            tx,
            intent_id,
            KIND_CAPTURE,
            command.amount_cents,
            command.business_date,
            &self.client_request_id,
        )
        .await?;

        info!(
            tenant_id = %tx.tenant(),
            payment_intent_id = %intent_id,
            amount_cents = command.amount_cents,
            "Payment captured"
        );

        let event = NewEvent::new(
            types::PAYMENT_CAPTURED,
            PaymentCaptured {
                payment_intent_id: intent_id,
                amount_cents: command.amount_cents,
                payment_type: &command.payment_type,
                sub_department_id: command.sub_department_id.as_deref(),
                business_date: command.business_date,
            },
        )?;
        Ok(WorkOutput::new(
            CaptureResult {
                payment_intent_id: intent_id,
                status: PaymentStatus::Captured,
                captured_amount_cents: command.amount_cents,
            },
            vec![event],
        ))
    }
}

struct Refund {
    client_request_id: String,
    command: RefundPayment,
}

#[async_trait]
impl UnitOfWork for Refund {
    type Output = RefundResult;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<RefundResult>, CommandError> {
        let command = self.command;
        if command.amount_cents <= 0 {
            return Err(CommandError::validation("refund amount must be positive"));
        }

        let tenant = tx.tenant().to_string();
        let intent_id = command.payment_intent_id.to_string();
        let row = sqlx::query(APPLY_REFUND_SQL)
            .bind(command.amount_cents)
            .bind(command.amount_cents)
            .bind(now_rfc3339())
            .bind(&tenant)
            .bind(&intent_id)
            .bind(command.amount_cents)
            .fetch_optional(tx.conn())
            .await?;

        let Some(row) = row else {
            return Err(refund_rejection(tx, &command).await?);
        };

        let status: String = row.try_get("status")?;
        let status = PaymentStatus::parse(&status)?;
        let payment_type: String = row.try_get("payment_type")?;
        let sub_department_id: Option<String> = row.try_get("sub_department_id")?;
        let captured_amount_cents: i64 = row.try_get("captured_amount_cents")?;
        let refunded_amount_cents: i64 = row.try_get("refunded_amount_cents")?;

        let refund_id = insert_transaction(
            tx,
            command.payment_intent_id,
            KIND_REFUND,
            command.amount_cents,
            command.business_date,
            &self.client_request_id,
        )
        .await?;

        info!(
            tenant_id = %tenant,
            payment_intent_id = %command.payment_intent_id,
            refund_id = %refund_id,
            amount_cents = command.amount_cents,
            refunded_amount_cents,
            %status,
            "Refund created"
        );

        let event = NewEvent::new(
            types::REFUND_CREATED,
            RefundCreated {
                payment_intent_id: command.payment_intent_id,
                refund_id,
                amount_cents: command.amount_cents,
                payment_type: &payment_type,
                sub_department_id: sub_department_id.as_deref(),
                business_date: command.business_date,
                reason: command.reason.as_deref(),
            },
        )?;
        Ok(WorkOutput::new(
            RefundResult {
                payment_intent_id: command.payment_intent_id,
                refund_id,
                status,
                captured_amount_cents,
                refunded_amount_cents,
            },
            vec![event],
        ))
    }
}

/// Explain why the conditional refund update matched no row.
async fn refund_rejection(
    tx: &mut TenantTx<'_>,
    command: &RefundPayment,
) -> Result<CommandError, CommandError> {
    let select = Query::select()
        .columns([
            PaymentIntents::Status,
            PaymentIntents::CapturedAmountCents,
            PaymentIntents::RefundedAmountCents,
        ])
        .from(PaymentIntents::Table)
        .and_where(Expr::col(PaymentIntents::TenantId).eq(tx.tenant().as_str()))
        .and_where(Expr::col(PaymentIntents::Id).eq(command.payment_intent_id.to_string()))
        .to_string(SqliteQueryBuilder);

    let Some(row) = tx.fetch_optional(&select).await? else {
        return Ok(CommandError::precondition(
            codes::PAYMENT_NOT_FOUND,
            format!("payment {} not found", command.payment_intent_id),
        ));
    };

    let status: String = row.try_get("status")?;
    let captured: i64 = row.try_get("captured_amount_cents")?;
    let refunded: i64 = row.try_get("refunded_amount_cents")?;
    Ok(match PaymentStatus::parse(&status)? {
        // Nothing captured remains to refund.
        PaymentStatus::Refunded => CommandError::precondition(
            codes::PAYMENT_NOT_CAPTURED,
            format!("payment {} is already fully refunded", command.payment_intent_id),
        ),
        PaymentStatus::Captured => CommandError::precondition(
            codes::REFUND_EXCEEDS_CAPTURE,
            format!(
                "refund of {} exceeds remaining {} on payment {}",
                command.amount_cents,
                captured - refunded,
                command.payment_intent_id
            ),
        ),
    })
}

async fn insert_transaction(
    tx: &mut TenantTx<'_>,
    intent_id: Uuid,
    kind: &str,
    amount_cents: i64,
    business_date: NaiveDate,
    client_request_id: &str,
) -> Result<Uuid, StorageError> {
    let id = Uuid::new_v4();
    let insert = Query::insert()
        .into_table(PaymentTransactions::Table)
        .columns([
            PaymentTransactions::Id,
            PaymentTransactions::TenantId,
            PaymentTransactions::IntentId,
            PaymentTransactions::Kind,
            PaymentTransactions::AmountCents,
            PaymentTransactions::BusinessDate,
            PaymentTransactions::ClientRequestId,
            PaymentTransactions::CreatedAt,
        ])
        .values_panic([
            id.to_string().into(),
            tx.tenant().as_str().into(),
            intent_id.to_string().into(),
            kind.into(),
            amount_cents.into(),
            business_date.to_string().into(),
            client_request_id.into(),
            now_rfc3339().into(),
        ])
        .to_string(SqliteQueryBuilder);
    tx.execute(&insert).await?;
    Ok(id)
}

/// Captured minus refunded funds by business date, optionally for one payment type.
#[derive(Debug, Clone, Default)]
pub struct CapturedFundsSubledger {
    payment_type: Option<String>,
}

impl CapturedFundsSubledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_payment_type(payment_type: impl Into<String>) -> Self {
        Self {
            payment_type: Some(payment_type.into()),
        }
    }
}

#[async_trait]
impl SubledgerSource for CapturedFundsSubledger {
    fn name(&self) -> &str {
        "payments.captured-funds"
    }

    async fn balance_cents(
        &self,
        tx: &mut TenantTx<'_>,
        range: &DateRange,
    ) -> Result<i64, CommandError> {
        let tenant = tx.tenant().to_string();
        let row = sqlx::query(SUBLEDGER_SQL)
            .bind(&tenant)
            .bind(&tenant)
            .bind(range.from.to_string())
            .bind(range.to.to_string())
            .bind(self.payment_type.as_deref())
            .bind(self.payment_type.as_deref())
            .fetch_one(tx.conn())
            .await?;
        Ok(row.try_get("balance")?)
    }
}
