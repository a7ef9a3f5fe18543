//! Ledgerbox - transactional consistency layer with a double-entry ledger
//!
//! Commands mutate state and record their events in one database transaction
//! (the outbox), guarded by client request ids (idempotency). A dispatcher
//! delivers committed events to consumers at most once in effect, and the
//! general ledger posts the resulting source documents as balanced journal
//! entries under accounting-period locks.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod ledger;
pub mod lock;
pub mod outbox;
pub mod payments;
pub mod scheduler;
pub mod storage;
pub mod utils;

pub use error::{CommandError, ErrorKind};
pub use events::{EventEnvelope, EventType, NewEvent};
pub use outbox::{CommandOutcome, OutboxPublisher, UnitOfWork, WorkOutput};
pub use storage::{StorageError, TenantId, TenantTx};
