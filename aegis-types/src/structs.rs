use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wall-clock seconds since the Unix epoch.
///
/// All kernel records carry timestamps in this representation so they
/// serialize identically on the wire and in the store.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Risk level attached to an operation.
///
/// The broker records risk as metadata; it does not enforce it by itself.
/// Grant policies and dashboards use it to decide what needs human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRisk {
    /// Pure observation: read content, list tabs.
    Read,
    /// Reversible side effects on the object graph: navigate, fill forms.
    Stateful,
    /// Side effects that escape the object graph: submit, send, pay.
    Irreversible,
}

impl fmt::Display for CapabilityRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityRisk::Read => write!(f, "read"),
            CapabilityRisk::Stateful => write!(f, "stateful"),
            CapabilityRisk::Irreversible => write!(f, "irreversible"),
        }
    }
}

/// An unforgeable token permitting a principal to perform an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub token: String,
    pub principal: String,
    pub operation: String,
    pub resource: String,
    pub risk: CapabilityRisk,
    pub constraints: Map<String, Value>,
    pub granted_at: f64,
    pub expires_at: Option<f64>,
}

impl Capability {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => epoch_now() > expires_at,
            None => false,
        }
    }

    /// Check if this capability grants the requested operation on a resource.
    pub fn matches(&self, operation: &str, resource: &str) -> bool {
        matches_operation(&self.operation, operation) && matches_resource(&self.resource, resource)
    }
}

/// Match an operation pattern against a concrete dotted operation name.
///
/// Supported forms: exact, `*`, and a trailing `.*` prefix match
/// (`tab.*` matches `tab.navigate`).
pub fn matches_operation(pattern: &str, operation: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        // "tab.*" covers "tab.navigate" but not "tabs.navigate"
        return operation.len() > prefix.len()
            && operation.starts_with(prefix)
            && operation.as_bytes()[prefix.len()] == b'.';
    }
    pattern == operation
}

/// Match a resource pattern against a concrete colon-namespaced id.
///
/// Supported forms: exact, `*`, and a trailing `:*` prefix match
/// (`tab:*` matches `tab:42`).
pub fn matches_resource(pattern: &str, resource: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return resource.len() > prefix.len()
            && resource.starts_with(prefix)
            && resource.as_bytes()[prefix.len()] == b':';
    }
    pattern == resource
}

/// Scope of a capability grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantScope {
    /// Single operation.
    Once,
    /// Until the owning session ends.
    Session,
    /// For a specific resource pattern.
    Resource,
    /// Permanent; persisted across restarts.
    Always,
}

impl fmt::Display for GrantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantScope::Once => write!(f, "once"),
            GrantScope::Session => write!(f, "session"),
            GrantScope::Resource => write!(f, "resource"),
            GrantScope::Always => write!(f, "always"),
        }
    }
}

/// A recorded capability grant with full lifecycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub id: String,
    /// Token of the capability issued by the broker.
    pub token: String,
    pub principal: String,
    pub operation: String,
    pub resource: String,
    pub scope: GrantScope,
    pub session_id: Option<String>,
    pub granted_at: f64,
    /// Who granted: "user", "policy", "system".
    pub granted_by: String,
    pub expires_at: Option<f64>,
    pub revoked_at: Option<f64>,
    pub revoked_by: Option<String>,
    pub metadata: Map<String, Value>,
}

impl CapabilityGrant {
    /// A grant is usable while it is neither revoked nor expired.
    pub fn is_active(&self) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => epoch_now() <= expires_at,
            None => true,
        }
    }
}

/// A record of a revoked capability.
///
/// Always persisted: the revocation ledger is the authoritative deny list,
/// and a token present in it can never become valid again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub id: String,
    pub grant_id: String,
    pub token: String,
    pub principal: String,
    pub operation: String,
    pub resource: String,
    pub revoked_at: f64,
    pub revoked_by: String,
    pub reason: String,
}

/// Types of capability sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Lives until the kernel process exits.
    Process,
    /// Lives until the workspace is closed.
    Workspace,
    /// Lives for a specified duration.
    Timed,
    /// Survives restarts (stored on disk).
    Persistent,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Process => write!(f, "process"),
            SessionType::Workspace => write!(f, "workspace"),
            SessionType::Timed => write!(f, "timed"),
            SessionType::Persistent => write!(f, "persistent"),
        }
    }
}

/// A capability session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub principal: String,
    pub created_at: f64,
    pub expires_at: Option<f64>,
    pub workspace_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => epoch_now() > expires_at,
            None => false,
        }
    }
}

/// Origin of an action or content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Human,
    Agent,
    WebContent,
    System,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Human => write!(f, "human"),
            Provenance::Agent => write!(f, "agent"),
            Provenance::WebContent => write!(f, "web_content"),
            Provenance::System => write!(f, "system"),
        }
    }
}

/// A single entry in the audit log. Entries are immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: f64,
    pub op: String,
    pub principal: String,
    pub object: String,
    pub args: Map<String, Value>,
    pub result: String,
    pub tx_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub provenance: Provenance,
    pub correlation_id: Option<String>,
}

/// Types of managed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Tab,
    Document,
    Form,
    Download,
    Workspace,
    Transaction,
    Checkpoint,
    Credential,
}

impl ObjectType {
    /// Short name used as the id prefix, e.g. `tab:42`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Tab => "tab",
            ObjectType::Document => "doc",
            ObjectType::Form => "form",
            ObjectType::Download => "download",
            ObjectType::Workspace => "workspace",
            ObjectType::Transaction => "tx",
            ObjectType::Checkpoint => "cp",
            ObjectType::Credential => "cred",
        }
    }

    pub fn parse(s: &str) -> Option<ObjectType> {
        match s {
            "tab" => Some(ObjectType::Tab),
            "doc" => Some(ObjectType::Document),
            "form" => Some(ObjectType::Form),
            "download" => Some(ObjectType::Download),
            "workspace" => Some(ObjectType::Workspace),
            "tx" => Some(ObjectType::Transaction),
            "cp" => Some(ObjectType::Checkpoint),
            "cred" => Some(ObjectType::Credential),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire-level view of a managed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub data: Map<String, Value>,
    pub created_at: f64,
    pub updated_at: f64,
}

impl ObjectRecord {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled_back"),
            TransactionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Terminal state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Completed,
    Failed,
    Timeout,
}

/// Result of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub state: ExecutionState,
    pub return_value: Option<Value>,
    pub error: Option<String>,
    /// Typed failure reason, e.g. "capability_denied", "validation", "host".
    pub error_kind: Option<String>,
    pub duration_ms: f64,
}

impl ExecutionOutcome {
    pub fn completed(return_value: Option<Value>, duration_ms: f64) -> Self {
        Self {
            state: ExecutionState::Completed,
            return_value,
            error: None,
            error_kind: None,
            duration_ms,
        }
    }

    pub fn failed(error: String, error_kind: &str, duration_ms: f64) -> Self {
        Self {
            state: ExecutionState::Failed,
            return_value: None,
            error: Some(error),
            error_kind: Some(error_kind.to_string()),
            duration_ms,
        }
    }

    pub fn timeout(error: String, duration_ms: f64) -> Self {
        Self {
            state: ExecutionState::Timeout,
            return_value: None,
            error: Some(error),
            error_kind: Some("timeout".to_string()),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_patterns() {
        assert!(matches_operation("*", "form.submit"));
        assert!(matches_operation("form.submit", "form.submit"));
        assert!(matches_operation("tab.*", "tab.navigate"));
        assert!(!matches_operation("tab.*", "tabs.navigate"));
        assert!(!matches_operation("tab.*", "tab"));
        assert!(!matches_operation("form.fill", "form.submit"));
    }

    #[test]
    fn resource_patterns() {
        assert!(matches_resource("*", "tab:42"));
        assert!(matches_resource("tab:42", "tab:42"));
        assert!(matches_resource("tab:*", "tab:42"));
        assert!(!matches_resource("tab:*", "table:42"));
        assert!(!matches_resource("tab:*", "tab"));
        assert!(!matches_resource("form:1", "form:17"));
    }

    #[test]
    fn grant_lifecycle_flags() {
        let mut grant = CapabilityGrant {
            id: "grant:1".into(),
            token: "t".into(),
            principal: "agent:a".into(),
            operation: "tab.read".into(),
            resource: "*".into(),
            scope: GrantScope::Session,
            session_id: None,
            granted_at: epoch_now(),
            granted_by: "user".into(),
            expires_at: None,
            revoked_at: None,
            revoked_by: None,
            metadata: Map::new(),
        };
        assert!(grant.is_active());

        grant.revoked_at = Some(epoch_now());
        assert!(!grant.is_active());

        grant.revoked_at = None;
        grant.expires_at = Some(epoch_now() - 1.0);
        assert!(!grant.is_active());
    }
}
