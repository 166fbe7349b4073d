//! Core types and error definitions for the Quorum orchestration engine.
//!
//! This crate provides the foundational types shared across all Quorum crates:
//! the error taxonomy, the serializable per-attempt error record, and the
//! tracing bootstrap used by binaries.
//!
//! # Main types
//!
//! - [`QuorumError`] - Unified error enum for the engine and its collaborators.
//! - [`QuorumResult`] - Convenience alias for `Result<T, QuorumError>`.
//! - [`ErrorKind`] - Fieldless classification of a [`QuorumError`].
//! - [`AttemptError`] - An error absorbed into a failed attempt result.

/// Tracing subscriber bootstrap.
pub mod telemetry;

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the Quorum engine.
///
/// The first seven variants form the dispatch taxonomy. Of those, only
/// validation, resource, no-capable-worker and dependency-cycle errors are
/// returned to callers of `submit_task`; the rest are absorbed into failed
/// attempt results.
#[derive(Debug, thiserror::Error)]
pub enum QuorumError {
    /// A malformed worker or task definition, rejected before dispatch.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A worker declared resource needs the host cannot satisfy.
    #[error("Resource error: {0}")]
    Resource(String),

    /// No registered worker matches the task type.
    #[error("No capable worker for task type '{0}'")]
    NoCapableWorker(String),

    /// A candidate failed its pre-dispatch liveness probe.
    #[error("Health error: {0}")]
    Health(String),

    /// An attempt exceeded its deadline.
    #[error("Timeout after {0} ms")]
    Timeout(u64),

    /// Hierarchical dependencies form a cycle.
    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    /// A worker reported a failure; its own message is preserved.
    #[error("Worker execution error: {0}")]
    WorkerExecution(String),

    /// The caller cancelled the orchestration before the attempt settled.
    #[error("Cancelled")]
    Cancelled,

    /// The engine is not in a state that accepts the call.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from a persistence collaborator.
    #[error("Store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`QuorumError`].
pub type QuorumResult<T> = Result<T, QuorumError>;

/// Fieldless classification of a [`QuorumError`], stable across serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or a rejected request.
    Validation,
    /// A capacity limit was hit.
    Resource,
    /// No registered worker matches the task type.
    NoCapableWorker,
    /// A worker failed its health check.
    Health,
    /// An attempt outlived its timeout or deadline.
    Timeout,
    /// Task dependencies form a cycle.
    DependencyCycle,
    /// The worker reported a failure.
    WorkerExecution,
    /// The caller cancelled the task.
    Cancelled,
    /// The engine is in the wrong state for the call.
    Lifecycle,
    /// Invalid configuration.
    Config,
    /// Persistence failed.
    Store,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Resource => "resource",
            ErrorKind::NoCapableWorker => "no_capable_worker",
            ErrorKind::Health => "health",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DependencyCycle => "dependency_cycle",
            ErrorKind::WorkerExecution => "worker_execution",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Lifecycle => "lifecycle",
            ErrorKind::Config => "config",
            ErrorKind::Store => "store",
        };
        f.write_str(name)
    }
}

impl QuorumError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuorumError::Validation(_) => ErrorKind::Validation,
            QuorumError::Resource(_) => ErrorKind::Resource,
            QuorumError::NoCapableWorker(_) => ErrorKind::NoCapableWorker,
            QuorumError::Health(_) => ErrorKind::Health,
            QuorumError::Timeout(_) => ErrorKind::Timeout,
            QuorumError::DependencyCycle(_) => ErrorKind::DependencyCycle,
            QuorumError::WorkerExecution(_) => ErrorKind::WorkerExecution,
            QuorumError::Cancelled => ErrorKind::Cancelled,
            QuorumError::Lifecycle(_) => ErrorKind::Lifecycle,
            QuorumError::Config(_) => ErrorKind::Config,
            QuorumError::Store(_) | QuorumError::Json(_) | QuorumError::Io(_) => ErrorKind::Store,
        }
    }

    /// Whether this error is raised at setup time and propagates to the caller
    /// instead of being absorbed into a failed attempt.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            QuorumError::Validation(_)
                | QuorumError::Resource(_)
                | QuorumError::NoCapableWorker(_)
                | QuorumError::DependencyCycle(_)
        )
    }
}

// --- Attempt errors ---

/// An error absorbed into a failed attempt result.
///
/// Unlike [`QuorumError`] this is plain data, so it can be cloned, compared
/// and written to the outcome log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable message; for worker failures this is the worker's own text.
    pub message: String,
}

impl AttemptError {
    /// Creates an attempt error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&QuorumError> for AttemptError {
    fn from(err: &QuorumError) -> Self {
        let message = match err {
            QuorumError::WorkerExecution(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
        }
    }
}

impl From<QuorumError> for AttemptError {
    fn from(err: QuorumError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
