//! Error kinds shared by the enforcement engine.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FirewallError>;

#[derive(Debug, Error)]
pub enum FirewallError {
    /// The kernel filtering subsystem could not be reached.
    #[error("filter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A staged batch did not apply. Nothing in the batch took effect.
    #[error("commit failed on {object}: {reason}")]
    CommitFailed { object: String, reason: String },

    /// Listing tables, chains or rules failed. Never read this as "zero".
    #[error("enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("process attribution unresolved: {0}")]
    AttributionUnresolved(String),

    #[error("no decision within {0:?}")]
    DecisionTimeout(Duration),

    #[error("prompt failed: {0}")]
    Prompt(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("unknown rule: {0}")]
    UnknownRule(String),

    #[error("rule already exists: {0}")]
    DuplicateRule(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FirewallError {
    pub fn commit_failed(object: impl Into<String>, reason: impl ToString) -> Self {
        FirewallError::CommitFailed {
            object: object.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient kernel unavailability is worth another attempt; everything
    /// else is returned to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FirewallError::BackendUnavailable(_))
    }
}
