//! Event envelope and type names.
//!
//! Events are produced by a unit of work as [`NewEvent`]s and stamped into
//! [`EventEnvelope`]s (id, tenant, timestamp) when they are appended to the
//! outbox, so an envelope only ever exists for a committed mutation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CommandError;
use crate::storage::TenantId;

/// Event type names published by this crate and the modules it listens to.
pub mod types {
    pub const SALE_COMPLETED: &str = "sales.sale.completed.v1";
    pub const PAYMENT_CAPTURED: &str = "payments.payment.captured.v1";
    pub const REFUND_CREATED: &str = "payments.refund.created.v1";
    pub const JOURNAL_POSTED: &str = "accounting.journal.posted.v1";
    pub const JOURNAL_VOIDED: &str = "accounting.journal.voided.v1";
    pub const POSTING_SKIPPED: &str = "accounting.posting.skipped.v1";
    pub const PERIOD_CLOSED: &str = "accounting.period.closed.v1";
}

/// Namespaced, versioned event type name such as `payments.refund.created.v1`.
///
/// Lowercase dot-separated segments, at least one namespace segment before the
/// trailing `vN` version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    pub fn parse(value: &str) -> Result<Self, CommandError> {
        if is_valid_event_type(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(CommandError::validation(format!(
                "invalid event type '{value}'"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_event_type(value: &str) -> bool {
    let segments: Vec<&str> = value.split('.').collect();
    let Some((version, names)) = segments.split_last() else {
        return false;
    };
    if names.len() < 2 {
        return false;
    }
    let valid_version = version
        .strip_prefix('v')
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false);
    let valid_name = |s: &&str| {
        s.starts_with(|c: char| c.is_ascii_lowercase())
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    };
    valid_version && names.iter().all(valid_name)
}

impl TryFrom<String> for EventType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_valid_event_type(&value) {
            Ok(Self(value))
        } else {
            Err(format!("invalid event type '{value}'"))
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event a unit of work wants recorded alongside its mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub data: serde_json::Value,
}

impl NewEvent {
    /// Build an event from any serialisable payload; the payload must be a JSON object.
    pub fn new(event_type: &str, data: impl Serialize) -> Result<Self, CommandError> {
        let event_type = EventType::parse(event_type)?;
        let data = serde_json::to_value(data)?;
        if !data.is_object() {
            return Err(CommandError::validation(format!(
                "payload of {event_type} must be a JSON object"
            )));
        }
        Ok(Self { event_type, data })
    }
}

/// Immutable event as stored in the outbox and delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub(crate) fn stamp(tenant: &TenantId, event: NewEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event.event_type,
            tenant_id: tenant.clone(),
            occurred_at: Utc::now(),
            data: event.data,
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, CommandError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            CommandError::validation(format!(
                "malformed {} payload in event {}: {e}",
                self.event_type, self.event_id
            ))
        })
    }
}
