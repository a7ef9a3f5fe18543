//! Posting driven by outbox events.
//!
//! The consumer runs inside the dispatcher's dedup transaction. Each posting
//! gets its own savepoint so a rejected posting leaves an action item behind
//! instead of failing the delivery; only infrastructure errors are retried.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sea_query::{OnConflict, Query, SqliteQueryBuilder};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dispatch::EventConsumer;
use crate::error::CommandError;
use crate::events::{types, EventEnvelope};
use crate::outbox;
use crate::storage::schema::GlUnpostedItems;
use crate::storage::{now_rfc3339, StorageError, TenantTx};

use super::posting::find_source_entry;
use super::{period_id_for, Dimensions, GlPostingEngine, PostingRequest, SourceLine};

pub const CONSUMER_NAME: &str = "gl-posting";

/// Sub-department key used when a refund does not carry one.
pub const UNASSIGNED_SUB_DEPARTMENT: &str = "unassigned";

/// Turns one event type into a posting request.
pub trait PostingTranslator: Send + Sync {
    fn event_type(&self) -> &str;

    /// `Validation` when the payload cannot describe a posting.
    fn translate(&self, event: &EventEnvelope) -> Result<PostingRequest, CommandError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleCompleted {
    sale_id: String,
    business_date: NaiveDate,
    #[serde(default)]
    location_id: Option<String>,
    lines: Vec<SaleLine>,
    #[serde(default)]
    tenders: Vec<SaleTender>,
    #[serde(default)]
    taxes: Vec<SaleTax>,
    #[serde(default)]
    exempt: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleLine {
    sub_department_id: String,
    amount_cents: i64,
    #[serde(default)]
    cost_cents: i64,
    #[serde(default)]
    department_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleTender {
    payment_type: String,
    amount_cents: i64,
    #[serde(default)]
    fee_cents: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleTax {
    tax_group_id: String,
    amount_cents: i64,
}

/// `sales.sale.completed.v1`: revenue, cost of goods, tenders and taxes of a sale.
pub struct SaleCompletedTranslator;

impl PostingTranslator for SaleCompletedTranslator {
    fn event_type(&self) -> &str {
        types::SALE_COMPLETED
    }

    fn translate(&self, event: &EventEnvelope) -> Result<PostingRequest, CommandError> {
        let sale: SaleCompleted = event.payload()?;

        let mut lines = Vec::new();
        for line in &sale.lines {
            let dimensions = Dimensions {
                location_id: sale.location_id.clone(),
                department_id: line.department_id.clone(),
            };
            lines.push(SourceLine::Revenue {
                sub_department_id: line.sub_department_id.clone(),
                amount_cents: line.amount_cents,
                dimensions: dimensions.clone(),
            });
            if line.cost_cents != 0 {
                lines.push(SourceLine::CostOfGoods {
                    sub_department_id: line.sub_department_id.clone(),
                    amount_cents: line.cost_cents,
                    dimensions,
                });
            }
        }
        lines.extend(sale.tenders.iter().map(|t| SourceLine::Tender {
            payment_type: t.payment_type.clone(),
            amount_cents: t.amount_cents,
            fee_cents: t.fee_cents,
        }));
        lines.extend(sale.taxes.iter().map(|t| SourceLine::Tax {
            tax_group_id: t.tax_group_id.clone(),
            amount_cents: t.amount_cents,
        }));

        let mut request = PostingRequest::new("sales", sale.sale_id.as_str(), sale.business_date, lines);
        request.memo = Some(format!("Sale {}", sale.sale_id));
        request.exempt = sale.exempt;
        Ok(request)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundCreated {
    payment_intent_id: String,
    refund_id: String,
    amount_cents: i64,
    payment_type: String,
    #[serde(default)]
    sub_department_id: Option<String>,
    business_date: NaiveDate,
}

/// `payments.refund.created.v1`: reverse revenue and clearing for the refunded amount.
pub struct RefundCreatedTranslator;

impl PostingTranslator for RefundCreatedTranslator {
    fn event_type(&self) -> &str {
        types::REFUND_CREATED
    }

    fn translate(&self, event: &EventEnvelope) -> Result<PostingRequest, CommandError> {
        let refund: RefundCreated = event.payload()?;
        if refund.amount_cents <= 0 {
            return Err(CommandError::validation(format!(
                "refund {} has non-positive amount {}",
                refund.refund_id, refund.amount_cents
            )));
        }
        let amount = -refund.amount_cents;

        let lines = vec![
            SourceLine::Revenue {
                sub_department_id: refund
                    .sub_department_id
                    .unwrap_or_else(|| UNASSIGNED_SUB_DEPARTMENT.to_string()),
                amount_cents: amount,
                dimensions: Dimensions::default(),
            },
            SourceLine::Tender {
                payment_type: refund.payment_type,
                amount_cents: amount,
                fee_cents: 0,
            },
        ];

        let mut request =
            PostingRequest::new("payments", refund.refund_id.as_str(), refund.business_date, lines);
        request.memo = Some(format!("Refund of payment {}", refund.payment_intent_id));
        Ok(request)
    }
}

/// Posts translated events to the ledger.
pub struct GlPostingConsumer {
    engine: Arc<GlPostingEngine>,
    translators: Vec<Arc<dyn PostingTranslator>>,
}

impl GlPostingConsumer {
    /// Consumer for sales and refunds.
    pub fn new(engine: Arc<GlPostingEngine>) -> Self {
        Self {
            engine,
            translators: vec![
                Arc::new(SaleCompletedTranslator),
                Arc::new(RefundCreatedTranslator),
            ],
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn PostingTranslator>) -> Self {
        self.translators.push(translator);
        self
    }

    fn translator_for(&self, event_type: &str) -> Option<&Arc<dyn PostingTranslator>> {
        self.translators
            .iter()
            .find(|t| t.event_type() == event_type)
    }
}

#[async_trait]
impl EventConsumer for GlPostingConsumer {
    fn name(&self) -> &str {
        CONSUMER_NAME
    }

    fn handles(&self, event_type: &str) -> bool {
        self.translator_for(event_type).is_some()
    }

    async fn handle(&self, tx: &mut TenantTx<'_>, event: &EventEnvelope) -> Result<(), CommandError> {
        let Some(translator) = self.translator_for(event.event_type.as_str()) else {
            return Ok(());
        };

        let request = match translator.translate(event) {
            Ok(request) => request,
            Err(err @ CommandError::Validation(_)) => {
                record_unposted(tx, event, None, &err).await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let mut savepoint = tx.nested().await?;
        match self.engine.post_in(&mut savepoint, request.clone()).await {
            Ok(output) => {
                outbox::append(&mut savepoint, output.events).await?;
                savepoint.commit().await?;
                debug!(
                    event_id = %event.event_id,
                    source_reference_id = %request.source_reference_id,
                    "Event posted to ledger"
                );
                Ok(())
            }
            Err(err) => {
                savepoint.rollback().await?;
                match err {
                    CommandError::Validation(_)
                    | CommandError::Precondition { .. }
                    | CommandError::OpenItems { .. } => {
                        record_unposted(tx, event, Some(&request), &err).await?;
                        Ok(())
                    }
                    CommandError::Conflict(message) => {
                        let existing = find_source_entry(
                            tx,
                            &request.source_module,
                            &request.source_reference_id,
                        )
                        .await?;
                        if existing.is_none() {
                            return Err(CommandError::Conflict(message));
                        }
                        debug!(
                            event_id = %event.event_id,
                            source_reference_id = %request.source_reference_id,
                            "Source already posted"
                        );
                        Ok(())
                    }
                    other => Err(other),
                }
            }
        }
    }
}

/// Leave an action item for an event the ledger could not post.
async fn record_unposted(
    tx: &mut TenantTx<'_>,
    event: &EventEnvelope,
    request: Option<&PostingRequest>,
    err: &CommandError,
) -> Result<(), StorageError> {
    let (reference, business_date) = match request {
        Some(r) => (r.source_reference_id.clone(), r.business_date),
        None => (
            event.event_id.to_string(),
            event
                .data
                .get("businessDate")
                .and_then(|v| v.as_str())
                .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
                .unwrap_or_else(|| event.occurred_at.date_naive()),
        ),
    };

    let insert = Query::insert()
        .into_table(GlUnpostedItems::Table)
        .columns([
            GlUnpostedItems::Id,
            GlUnpostedItems::TenantId,
            GlUnpostedItems::EventId,
            GlUnpostedItems::EventType,
            GlUnpostedItems::SourceReferenceId,
            GlUnpostedItems::BusinessDate,
            GlUnpostedItems::PeriodId,
            GlUnpostedItems::Reason,
            GlUnpostedItems::CreatedAt,
        ])
        .values_panic([
            Uuid::new_v4().to_string().into(),
            tx.tenant().as_str().into(),
            event.event_id.to_string().into(),
            event.event_type.as_str().into(),
            reference.as_str().into(),
            business_date.to_string().into(),
            period_id_for(business_date).into(),
            err.to_string().into(),
            now_rfc3339().into(),
        ])
        .on_conflict(
            OnConflict::column(GlUnpostedItems::EventId)
                .do_nothing()
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder);
    tx.execute(&insert).await?;

    warn!(
        tenant_id = %tx.tenant(),
        event_id = %event.event_id,
        event_type = %event.event_type,
        source_reference_id = %reference,
        code = err.code(),
        error = %err,
        "Event not posted, recorded as unposted item"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::NewEvent;
    use crate::storage::TenantId;

    fn envelope(event_type: &str, data: serde_json::Value) -> EventEnvelope {
        EventEnvelope::stamp(
            &TenantId::from("t1"),
            NewEvent::new(event_type, data).unwrap(),
        )
    }

    #[test]
    fn test_sale_translation() {
        let event = envelope(
            types::SALE_COMPLETED,
            json!({
                "saleId": "s-1",
                "businessDate": "2024-03-15",
                "locationId": "store-1",
                "lines": [{"subDepartmentId": "grocery", "amountCents": 1000, "costCents": 600}],
                "tenders": [{"paymentType": "card", "amountCents": 1080, "feeCents": 25}],
                "taxes": [{"taxGroupId": "vat", "amountCents": 80}]
            }),
        );

        let request = SaleCompletedTranslator.translate(&event).unwrap();
        assert_eq!(request.source_module, "sales");
        assert_eq!(request.source_reference_id, "s-1");
        assert_eq!(request.lines.len(), 4);
        assert!(matches!(
            &request.lines[0],
            SourceLine::Revenue { dimensions, .. } if dimensions.location_id.as_deref() == Some("store-1")
        ));
        assert!(!request.exempt);
    }

    #[test]
    fn test_refund_translation_negates_amounts() {
        let event = envelope(
            types::REFUND_CREATED,
            json!({
                "paymentIntentId": "pi-1",
                "refundId": "r-1",
                "amountCents": 300,
                "paymentType": "card",
                "businessDate": "2024-03-16"
            }),
        );

        let request = RefundCreatedTranslator.translate(&event).unwrap();
        assert_eq!(request.source_reference_id, "r-1");
        assert_eq!(
            request.lines[0],
            SourceLine::Revenue {
                sub_department_id: UNASSIGNED_SUB_DEPARTMENT.to_string(),
                amount_cents: -300,
                dimensions: Dimensions::default(),
            }
        );
    }

    #[test]
    fn test_malformed_payload_is_validation() {
        let event = envelope(types::SALE_COMPLETED, json!({"saleId": 7}));
        assert!(matches!(
            SaleCompletedTranslator.translate(&event),
            Err(CommandError::Validation(_))
        ));
    }
}
