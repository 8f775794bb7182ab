//! Error types for skein.
//!
//! Every variant carries a stable code so embedding applications and
//! queue adapters can branch on failures without string matching.

use thiserror::Error;

/// Result type alias for skein operations.
pub type Result<T> = std::result::Result<T, Error>;

/// skein error types.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested workflow id has no record in the store.
    ///
    /// Surfaced to the caller, never retried internally.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A `perform` call addressed a job id absent from its workflow.
    #[error("Job '{job_id}' not found in workflow '{workflow_id}'")]
    JobNotFound { workflow_id: String, job_id: String },

    /// A build recipe referenced a job that was never declared.
    ///
    /// Fatal at build time; this can never occur at runtime because
    /// edges are only created through the builder.
    #[error("Dependency not found: {0}")]
    DependencyNotFound(String),

    /// The kind identifier is not present in the registry.
    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    /// The per-workflow continuation lock could not be acquired in time.
    ///
    /// Non-fatal at the continuation boundary: the attempt is dropped and
    /// a sibling completion's own continuation step will retry.
    #[error("Lock timeout for workflow '{0}'")]
    LockTimeout(String),

    /// A job kind's work function failed.
    ///
    /// Caught at the orchestrator boundary and converted to a Failed
    /// transition; never propagated to crash the worker process.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Structurally invalid workflow, e.g. a dependency cycle.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage protocol error (bad record shape, id allocation exhausted).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The external key-value service is unreachable or misbehaving.
    ///
    /// Propagates out of `perform`, leaving redelivery to the queue's
    /// own retry policy.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the stable error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Error::JobNotFound { .. } => "JOB_NOT_FOUND",
            Error::DependencyNotFound(_) => "DEPENDENCY_NOT_FOUND",
            Error::UnknownKind(_) => "UNKNOWN_KIND",
            Error::LockTimeout(_) => "LOCK_TIMEOUT",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Redis(_) => "REDIS_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the error is recoverable by a later, independent attempt.
    ///
    /// Lock timeouts are the canonical case: every completion re-attempts
    /// the continuation step, so a dropped attempt loses no progress.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::LockTimeout(_))
    }
}
