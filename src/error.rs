//! Command error taxonomy.
//!
//! Every public operation that changes state returns [`CommandError`]. The
//! variant tells the caller whether retrying can help: validation and
//! precondition failures are final, conflicts are retried by the caller with
//! backoff, and infrastructure failures retry the whole (idempotent) command.

use std::fmt;

use crate::ledger::period::CloseBlocker;
use crate::storage::StorageError;

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, CommandError>;

/// Precondition codes surfaced to callers.
pub mod codes {
    pub const PERIOD_CLOSED: &str = "period_closed";
    pub const PERIOD_ALREADY_CLOSED: &str = "period_already_closed";
    pub const PAYMENT_NOT_FOUND: &str = "payment_not_found";
    pub const PAYMENT_NOT_CAPTURED: &str = "payment_not_captured";
    pub const REFUND_EXCEEDS_CAPTURE: &str = "refund_exceeds_capture";
    pub const ENTRY_NOT_FOUND: &str = "entry_not_found";
    pub const ENTRY_NOT_DRAFT: &str = "entry_not_draft";
    pub const ENTRY_NOT_POSTED: &str = "entry_not_posted";
    pub const PERIOD_OPEN_ITEMS: &str = "period_open_items";
}

/// Coarse classification of a [`CommandError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Precondition,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed ({code}): {message}")]
    Precondition { code: &'static str, message: String },

    #[error("Period {period} has {} open item(s)", blockers.len())]
    OpenItems {
        period: String,
        blockers: Vec<CloseBlocker>,
    },

    #[error("Infrastructure error: {0}")]
    Infrastructure(StorageError),
}

impl CommandError {
    pub fn validation(message: impl Into<String>) -> Self {
        CommandError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        CommandError::Conflict(message.into())
    }

    pub fn precondition(code: &'static str, message: impl Into<String>) -> Self {
        CommandError::Precondition {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Validation(_) => ErrorKind::Validation,
            CommandError::Conflict(_) => ErrorKind::Conflict,
            CommandError::Precondition { .. } | CommandError::OpenItems { .. } => {
                ErrorKind::Precondition
            }
            CommandError::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }

    /// Machine-readable code: the precondition code where there is one,
    /// otherwise the kind.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Precondition { code, .. } => code,
            CommandError::OpenItems { .. } => codes::PERIOD_OPEN_ITEMS,
            other => other.kind().as_str(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::Infrastructure
        )
    }
}

impl From<StorageError> for CommandError {
    fn from(err: StorageError) -> Self {
        if err.is_unique_violation() {
            CommandError::Conflict(err.to_string())
        } else if err.is_busy() {
            CommandError::Conflict(format!("database busy: {err}"))
        } else {
            CommandError::Infrastructure(err)
        }
    }
}

impl From<sqlx::Error> for CommandError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::from(err).into()
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        CommandError::Infrastructure(StorageError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_code_is_exposed() {
        let err = CommandError::precondition(codes::PERIOD_CLOSED, "2024-03 is closed");
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.code(), "period_closed");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_conflict_is_retryable() {
        let err = CommandError::conflict("request in progress");
        assert_eq!(err.code(), "conflict");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_open_items_message_counts_blockers() {
        let err = CommandError::OpenItems {
            period: "2024-03".to_string(),
            blockers: vec![],
        };
        assert_eq!(err.to_string(), "Period 2024-03 has 0 open item(s)");
        assert_eq!(err.code(), codes::PERIOD_OPEN_ITEMS);
    }

    #[test]
    fn test_storage_errors_default_to_infrastructure() {
        let err: CommandError = StorageError::InvalidTimestamp("x".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.is_retryable());
    }
}
