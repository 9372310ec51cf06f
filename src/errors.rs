//! Typed error hierarchy for the agent manager.
//!
//! Two layers cover the two audiences:
//! - `OrchestratorError`: returned by every public façade method; callers
//!   match on `kind()` to decide how to react.
//! - `PhaseError`: carried between Run Executor phases and classified with a
//!   `FailureKind` before it becomes a Run status mutation.

use thiserror::Error;

/// Coarse error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    InvalidState,
    PolicyViolation,
    Database,
    Sandbox,
    Runner,
    Timeout,
    Cancelled,
    Configuration,
    Conflict,
}

/// Errors returned from the orchestrator façade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Illegal state transition: {0}")]
    InvalidState(String),

    #[error("Denied by policy {policy_id} ({policy_name}) rule '{rule}': {reason}")]
    PolicyViolation {
        policy_id: String,
        policy_name: String,
        rule: String,
        reason: String,
    },

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            Self::Database(_) => ErrorKind::Database,
            Self::Sandbox(_) => ErrorKind::Sandbox,
            Self::Runner(_) => ErrorKind::Runner,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Conflict(_) => ErrorKind::Conflict,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<PhaseError> for OrchestratorError {
    fn from(err: PhaseError) -> Self {
        match err.kind {
            FailureKind::Transient | FailureKind::Database => {
                Self::Database(anyhow::anyhow!(err.message))
            }
            FailureKind::Sandbox => Self::Sandbox(err.message),
            FailureKind::Runner => Self::Runner(err.message),
            FailureKind::Timeout => Self::Timeout(err.message),
            FailureKind::Cancelled => Self::Cancelled(err.message),
            FailureKind::Configuration => Self::Configuration(err.message),
        }
    }
}

/// Classification attached to every error raised inside a Run Executor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying within the same phase.
    Transient,
    Sandbox,
    Runner,
    Timeout,
    Cancelled,
    Configuration,
    Database,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Sandbox => "sandbox",
            Self::Runner => "runner",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
            Self::Database => "database",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified phase failure.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct PhaseError {
    pub kind: FailureKind,
    pub message: String,
}

impl PhaseError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Sandbox, message)
    }

    pub fn runner(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Runner, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Configuration, message)
    }

    /// Repository failures are treated as transient: SQLite busy/locked
    /// errors usually clear on the next attempt.
    pub fn database(err: anyhow::Error) -> Self {
        Self::new(FailureKind::Transient, format!("{:#}", err))
    }
}
