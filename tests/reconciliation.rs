//! Card clearing reconciled against captured funds.

mod common;

use rust_decimal::Decimal;

use common::{date, memory_pool, tenant, CompleteSale, Ledger};
use ledgerbox::config::LedgerConfig;
use ledgerbox::ledger::{DateRange, Reconciler};
use ledgerbox::payments::{CapturePayment, CapturedFundsSubledger, PaymentService, RefundPayment};

async fn sell_and_capture(ledger: &Ledger, payments: &PaymentService, sale_id: &str, day: u32, amount_cents: i64) -> uuid::Uuid {
    ledger
        .publisher()
        .publish(tenant(), CompleteSale::grocery(sale_id, date(2024, 3, day), amount_cents))
        .await
        .unwrap();
    payments
        .capture(
            tenant(),
            &format!("cap-{sale_id}"),
            CapturePayment {
                payment_type: "card".to_string(),
                amount_cents,
                sub_department_id: Some("grocery".to_string()),
                business_date: date(2024, 3, day),
            },
        )
        .await
        .unwrap()
        .into_inner()
        .payment_intent_id
}

fn march() -> DateRange {
    DateRange::new(date(2024, 3, 1), date(2024, 3, 31)).unwrap()
}

#[tokio::test]
async fn test_clearing_reconciles_after_sales_and_refund() {
    let ledger = Ledger::new(memory_pool().await).await;
    let payments = PaymentService::new(ledger.publisher());

    sell_and_capture(&ledger, &payments, "s-1", 4, 1999).await;
    let intent = sell_and_capture(&ledger, &payments, "s-2", 9, 5000).await;
    payments
        .refund(
            tenant(),
            "refund-1",
            RefundPayment {
                payment_intent_id: intent,
                amount_cents: 1250,
                business_date: date(2024, 3, 12),
                reason: Some("returned item".to_string()),
            },
        )
        .await
        .unwrap();

    let reconciler = Reconciler::new(ledger.pool.clone(), LedgerConfig::default().reconciliation_tolerance);
    let report = reconciler
        .reconcile(tenant(), "1100", &march(), &CapturedFundsSubledger::for_payment_type("card"))
        .await
        .unwrap();

    assert!(report.is_reconciled);
    assert_eq!(report.gl_balance, Decimal::new(5749, 2));
    assert_eq!(report.subledger_balance, report.gl_balance);
}

#[tokio::test]
async fn test_capture_without_sale_shows_difference() {
    let ledger = Ledger::new(memory_pool().await).await;
    let payments = PaymentService::new(ledger.publisher());
    sell_and_capture(&ledger, &payments, "s-1", 4, 1000).await;

    // Captured at the terminal but the sale never reached the ledger.
    payments
        .capture(
            tenant(),
            "cap-orphan",
            CapturePayment {
                payment_type: "card".to_string(),
                amount_cents: 275,
                sub_department_id: None,
                business_date: date(2024, 3, 5),
            },
        )
        .await
        .unwrap();

    let reconciler = Reconciler::new(ledger.pool.clone(), LedgerConfig::default().reconciliation_tolerance);
    let report = reconciler
        .reconcile(tenant(), "1100", &march(), &CapturedFundsSubledger::new())
        .await
        .unwrap();

    assert!(!report.is_reconciled);
    assert_eq!(report.difference, Decimal::new(-275, 2));
}

#[tokio::test]
async fn test_range_excludes_other_days() {
    let ledger = Ledger::new(memory_pool().await).await;
    let payments = PaymentService::new(ledger.publisher());
    sell_and_capture(&ledger, &payments, "s-1", 4, 1000).await;
    sell_and_capture(&ledger, &payments, "s-2", 20, 3000).await;

    let reconciler = Reconciler::new(ledger.pool.clone(), LedgerConfig::default().reconciliation_tolerance);
    let first_half = DateRange::new(date(2024, 3, 1), date(2024, 3, 15)).unwrap();
    let report = reconciler
        .reconcile(tenant(), "1100", &first_half, &CapturedFundsSubledger::new())
        .await
        .unwrap();

    assert_eq!(report.gl_balance, Decimal::new(1000, 2));
    assert!(report.is_reconciled);
}
