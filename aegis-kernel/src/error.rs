use thiserror::Error;

/// Error kinds carried across the kernel API boundary.
///
/// Messages never include capability token strings or sensitive argument
/// values; denials name the principal, operation and resource only.
#[derive(Debug, Clone, Error)]
pub enum KernelError {
    /// Authorization failure. The primary recoverable failure mode for
    /// workflow code; always audited before it is raised.
    #[error("capability denied: {principal} cannot {operation} on {resource} ({reason})")]
    CapabilityDenied {
        principal: String,
        operation: String,
        resource: String,
        reason: String,
    },

    /// Workflow source failed static validation. Returned before any
    /// execution happens or audit entries are created.
    #[error("workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("transaction {0} is not active")]
    TransactionNotActive(String),

    #[error("transaction {0} is already active")]
    TransactionActive(String),

    #[error("checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("object {id} is not a {expected}")]
    WrongObjectType {
        id: String,
        expected: aegis_types::structs::ObjectType,
    },

    /// Execution exceeded its wall-clock budget. Terminal for the execution.
    #[error("execution timed out after {0:.1}s")]
    Timeout(f64),

    /// The backing store rejected a write. Fatal to the current operation;
    /// the in-memory state being recorded is left untouched.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Script-level failure inside a workflow (bad name, bad operand, bad
    /// call). Recovered by the runtime into a failed execution result.
    #[error("workflow error: {0}")]
    Workflow(String),

    /// Invariant violation. Terminal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KernelError {
    pub fn denied(principal: &str, operation: &str, resource: &str, reason: &str) -> Self {
        KernelError::CapabilityDenied {
            principal: principal.to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable name used as the `error_kind` of a failed
    /// execution outcome.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::CapabilityDenied { .. } => "capability_denied",
            KernelError::Validation(_) => "validation",
            KernelError::TransactionNotActive(_) | KernelError::TransactionActive(_) => {
                "transaction"
            }
            KernelError::CheckpointNotFound(_) => "checkpoint_not_found",
            KernelError::ObjectNotFound(_) => "object_not_found",
            KernelError::WrongObjectType { .. } => "wrong_object_type",
            KernelError::Timeout(_) => "timeout",
            KernelError::Storage(_) => "storage",
            KernelError::Workflow(_) => "workflow",
            KernelError::Internal(_) => "internal",
        }
    }
}

impl From<rocksdb::Error> for KernelError {
    fn from(e: rocksdb::Error) -> Self {
        KernelError::Storage(e.to_string())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
