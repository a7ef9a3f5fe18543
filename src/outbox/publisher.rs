//! Command execution around the outbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::error::CommandError;
use crate::events::{EventEnvelope, NewEvent};
use crate::idempotency::{self, IdempotencyCheck, IdempotencyKey};
use crate::storage::{TenantId, TenantTx};

const DEFAULT_RETENTION: Duration = Duration::from_secs(72 * 3600);

/// What a unit of work hands back: its result and the events it produced.
#[derive(Debug)]
pub struct WorkOutput<T> {
    pub result: T,
    pub events: Vec<NewEvent>,
}

impl<T> WorkOutput<T> {
    pub fn new(result: T, events: Vec<NewEvent>) -> Self {
        Self { result, events }
    }

    pub fn without_events(result: T) -> Self {
        Self {
            result,
            events: Vec::new(),
        }
    }
}

/// The domain part of a command: validate, mutate, describe what happened.
///
/// Runs inside the publisher's transaction. Returning `Err` discards every
/// write made through `tx`.
#[async_trait]
pub trait UnitOfWork: Send {
    type Output: Send;

    async fn run(self, tx: &mut TenantTx<'_>) -> Result<WorkOutput<Self::Output>, CommandError>;
}

/// Result of an idempotent command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome<T> {
    /// The command ran and committed now.
    Applied(T),
    /// The request id was already completed; this is the stored result.
    Duplicate(T),
}

impl<T> CommandOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            CommandOutcome::Applied(value) | CommandOutcome::Duplicate(value) => value,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CommandOutcome::Duplicate(_))
    }
}

/// Runs units of work so that their mutation and their events commit together.
#[derive(Clone)]
pub struct OutboxPublisher {
    pool: SqlitePool,
    retention: Duration,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl OutboxPublisher {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retention: DEFAULT_RETENTION,
            dispatcher: None,
        }
    }

    /// Dispatch the tenant's pending events right after each commit.
    pub fn with_inline_dispatch(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// How long completed idempotent results stay replayable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `work` in one transaction and record its events in the outbox.
    pub async fn publish<W>(&self, tenant: TenantId, work: W) -> Result<W::Output, CommandError>
    where
        W: UnitOfWork,
    {
        let mut tx = TenantTx::begin(&self.pool, tenant.clone()).await?;
        let output = work.run(&mut tx).await?;
        let envelopes = crate::outbox::append(&mut tx, output.events).await?;
        tx.commit().await?;

        self.after_commit(&tenant, &envelopes).await;
        Ok(output.result)
    }

    /// Like [`Self::publish`], guarded by an idempotency key.
    ///
    /// A replay of a completed key returns the stored result without running
    /// `work`; a key still in progress elsewhere fails with `Conflict`.
    pub async fn publish_idempotent<W>(
        &self,
        tenant: TenantId,
        key: IdempotencyKey,
        work: W,
    ) -> Result<CommandOutcome<W::Output>, CommandError>
    where
        W: UnitOfWork,
        W::Output: Serialize + DeserializeOwned,
    {
        let mut tx = TenantTx::begin(&self.pool, tenant.clone()).await?;

        if let IdempotencyCheck::Duplicate(stored) =
            idempotency::check_idempotency(&mut tx, &key).await?
        {
            tx.rollback().await?;
            let result = serde_json::from_value(stored)?;
            return Ok(CommandOutcome::Duplicate(result));
        }

        let output = work.run(&mut tx).await?;
        let stored = serde_json::to_value(&output.result)?;
        idempotency::save_idempotency_key(&mut tx, &key, &stored, self.retention).await?;
        let envelopes = crate::outbox::append(&mut tx, output.events).await?;
        tx.commit().await?;

        self.after_commit(&tenant, &envelopes).await;
        Ok(CommandOutcome::Applied(output.result))
    }

    async fn after_commit(&self, tenant: &TenantId, envelopes: &[EventEnvelope]) {
        if envelopes.is_empty() {
            return;
        }
        debug!(tenant_id = %tenant, events = envelopes.len(), "Command committed");

        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        match dispatcher.dispatch_tenant(tenant).await {
            Ok(report) => {
                for failure in &report.errors {
                    warn!(
                        tenant_id = %tenant,
                        event_id = %failure.event_id,
                        consumer = %failure.consumer,
                        error = %failure.error,
                        "Inline dispatch failed, left for relay"
                    );
                }
            }
            Err(e) => {
                warn!(tenant_id = %tenant, error = %e, "Inline dispatch pass failed");
            }
        }
    }
}
