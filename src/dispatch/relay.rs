//! Background relay: runs dispatch passes on a timer.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::Dispatcher;
use crate::storage::StorageError;
use crate::utils::retry::relay_backoff;

/// Handle to a running relay task.
pub struct RelayHandle {
    cancel: tokio::sync::watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signal the relay to stop after its current pass.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the task to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Relay task ended abnormally");
        }
    }
}

/// Spawn a task that dispatches pending outbox rows every `interval`.
pub fn spawn_relay(dispatcher: Arc<Dispatcher>, interval: Duration) -> RelayHandle {
    let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

    let task = tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            worker_id = dispatcher.worker_id(),
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    run_pass(&dispatcher).await;
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("Outbox relay stopped");
                        break;
                    }
                }
            }
        }
    });

    RelayHandle {
        cancel: cancel_tx,
        task,
    }
}

async fn run_pass(dispatcher: &Arc<Dispatcher>) {
    let pass = (|| {
        let d = dispatcher.clone();
        async move { d.dispatch_pending().await }
    })
    .retry(relay_backoff())
    .when(|e: &StorageError| matches!(e, StorageError::Database(_)))
    .notify(|e: &StorageError, delay: Duration| {
        warn!(error = %e, delay = ?delay, "Dispatch pass failed, retrying");
    })
    .await;

    match pass {
        Ok(report) => {
            for failure in report.errors.iter().filter(|f| f.dead) {
                error!(
                    tenant_id = %failure.tenant_id,
                    event_id = %failure.event_id,
                    consumer = %failure.consumer,
                    "Outbox row needs operator attention"
                );
            }
        }
        Err(e) => error!(error = %e, "Dispatch pass abandoned"),
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::config::OutboxConfig;
    use crate::events::{types, NewEvent};
    use crate::outbox::{self, entries_for_tenant, OutboxStatus};
    use crate::storage::{init_schema, TenantId, TenantTx};

    #[tokio::test]
    async fn test_relay_dispatches_and_stops() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();

        let tenant = TenantId::from("t1");
        let mut tx = TenantTx::begin(&pool, tenant.clone()).await.unwrap();
        let event = NewEvent::new(types::PAYMENT_CAPTURED, serde_json::json!({})).unwrap();
        outbox::append(&mut tx, vec![event]).await.unwrap();
        tx.commit().await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), &OutboxConfig::default()));
        let relay = spawn_relay(dispatcher, Duration::from_millis(10));

        let mut dispatched = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let entries = entries_for_tenant(&pool, &tenant).await.unwrap();
            if entries[0].status == OutboxStatus::Dispatched {
                dispatched = true;
                break;
            }
        }
        relay.shutdown().await;
        assert!(dispatched);
    }
}
