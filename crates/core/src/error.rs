//! Error taxonomy shared by every crate in the workspace.

use std::time::Duration;

use thiserror::Error;

/// How the dispatcher treats a failed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff; ordering for the key is preserved.
    Transient,
    /// Surfaced as a status condition; the event counts as processed.
    Permanent,
    /// Logged and dead-lettered.
    Fatal,
}

#[derive(Debug, Error)]
pub enum KansoError {
    #[error("transient: {0}")]
    Transient(String),

    /// Optimistic-concurrency mismatch on a versioned row or object.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("invalid spec: {0}")]
    Validation(String),

    #[error("missing reference: {kind} {name}")]
    MissingReference { kind: String, name: String },

    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type KansoResult<T> = Result<T, KansoError>;

impl KansoError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KansoError::Transient(_) | KansoError::Conflict(_) | KansoError::NamespaceNotFound(_) => ErrorClass::Transient,
            KansoError::Validation(_) | KansoError::MissingReference { .. } | KansoError::UniqueViolation(_) => {
                ErrorClass::Permanent
            }
            KansoError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short machine reason used in status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            KansoError::Transient(_) | KansoError::NamespaceNotFound(_) => "Transient",
            KansoError::Conflict(_) => "Conflict",
            KansoError::Validation(_) => "InvalidSpec",
            KansoError::MissingReference { .. } => "MissingReference",
            KansoError::UniqueViolation(_) => "UniqueViolation",
            KansoError::Fatal(_) => "Internal",
        }
    }

    pub fn missing(kind: impl Into<String>, name: impl Into<String>) -> Self {
        KansoError::MissingReference { kind: kind.into(), name: name.into() }
    }
}

/// Exponential backoff for the given attempt (1-based), capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << shift).min(max)
}
