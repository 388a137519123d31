pub mod structs;
pub mod wire;

use serde::{Deserialize, Serialize};
use structs::{
    AuditEntry, Capability, CapabilityRisk, ExecutionOutcome, GrantScope, ObjectRecord, ObjectType,
};

/// Requests accepted by the kernel over the local IPC socket.
///
/// Serialized as `{"method": ..., "params": {...}}` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum KernelRequest {
    // Workflow commands
    Execute {
        code: String,
        principal: String,
    },
    Validate {
        code: String,
    },

    // Capability commands
    Grant {
        principal: String,
        operation: String,
        resource: String,
        risk: CapabilityRisk,
        ttl_seconds: Option<f64>,
        scope: Option<GrantScope>,
    },
    Revoke {
        token: String,
    },
    ListCapabilities {
        principal: String,
    },

    // Introspection commands
    QueryAudit {
        principal: Option<String>,
        op: Option<String>,
        tx_id: Option<String>,
        limit: Option<usize>,
    },
    ListObjects {
        object_type: Option<ObjectType>,
    },
}

/// Responses returned by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum KernelResponse {
    Execution(ExecutionOutcome),
    Validation { valid: bool, errors: Vec<String> },
    Granted(Capability),
    Revoked(bool),
    Capabilities(Vec<Capability>),
    AuditEntries(Vec<AuditEntry>),
    Objects(Vec<ObjectRecord>),
    Error(String),
}
