//! Domain error model.

use thiserror::Error;

use crate::job::JobState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, lifecycle
/// invariants, conflicts). They are raised before any mutation is persisted.
/// Storage and execution failures belong to the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A job spec or config value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested job (or DLQ entry) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The job lifecycle does not allow this transition.
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    /// The operation conflicts with the current state of another record.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
