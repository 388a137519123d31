//! Append-only audit log with provenance tracking.
//!
//! Every privileged operation is recorded with who (principal), what (op),
//! which resource (object), parameters, outcome, transaction context, and
//! provenance. Sensitive argument values are redacted and PII field names are
//! hashed before anything reaches the store, so secrets and schema details
//! never land on disk.

use crate::error::{KernelError, KernelResult};
use crate::store::{KernelStore, AUDIT_PREFIX};
use aegis_types::structs::{epoch_now, AuditEntry, Provenance};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Marker substituted for sensitive values.
pub const REDACTED: &str = "[REDACTED]";

/// Value keys redacted outright. A key matches when any `_`-separated
/// segment equals one of these (case-insensitive).
const REDACT_KEYS: &[&str] = &["password", "secret", "token", "key", "credential"];

/// Substrings that classify a field name as PII.
const PII_FIELD_NAMES: &[&str] = &[
    "ssn",
    "social_security",
    "dob",
    "date_of_birth",
    "credit_card",
    "card_number",
    "cvv",
    "phone",
    "address",
    "zip",
    "postal",
];

/// List-valued keys whose string elements are treated as field names.
const FIELD_LIST_KEYS: &[&str] = &["fields", "filled_fields"];

/// Filters for [`AuditLog::query`]. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub principal: Option<String>,
    pub op: Option<String>,
    pub object: Option<String>,
    pub tx_id: Option<String>,
    pub since: Option<f64>,
    pub until: Option<f64>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_principal(principal: &str) -> Self {
        Self {
            principal: Some(principal.to_string()),
            ..Default::default()
        }
    }

    pub fn for_tx(tx_id: &str) -> Self {
        Self {
            tx_id: Some(tx_id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_op(op: &str) -> Self {
        Self {
            op: Some(op.to_string()),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(principal) = &self.principal {
            if &entry.principal != principal {
                return false;
            }
        }
        if let Some(op) = &self.op {
            // Trailing '*' is a prefix match, e.g. "transaction.*" or "tab.*"
            match op.strip_suffix('*') {
                Some(prefix) => {
                    if !entry.op.starts_with(prefix) {
                        return false;
                    }
                }
                None => {
                    if &entry.op != op {
                        return false;
                    }
                }
            }
        }
        if let Some(object) = &self.object {
            if &entry.object != object {
                return false;
            }
        }
        if let Some(tx_id) = &self.tx_id {
            if entry.tx_id.as_deref() != Some(tx_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

struct AuditInner {
    entries: Vec<AuditEntry>,
    next_seq: u64,
    current_tx: Option<String>,
    current_checkpoint: Option<String>,
    hash_field_names: bool,
}

/// Append-only audit log backed by the kernel store.
///
/// Appends are serialized by a single mutex and written durably before the
/// in-memory mirror advances; a storage failure surfaces as
/// [`KernelError::Storage`] and leaves the log unchanged. Queries never fail;
/// no matches is an empty result.
pub struct AuditLog {
    store: Arc<KernelStore>,
    workspace_salt: String,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    /// Open the log, mirroring previously persisted entries into memory.
    ///
    /// `workspace_salt` keys the PII field-name hashing; passing `None`
    /// generates a random salt, which makes hashes unlinkable across runs.
    pub fn open(store: Arc<KernelStore>, workspace_salt: Option<String>) -> KernelResult<Self> {
        let rows: Vec<(String, AuditEntry)> = store.scan_prefix(AUDIT_PREFIX)?;
        let next_seq = rows
            .iter()
            .filter_map(|(key, _)| key.parse::<u64>().ok())
            .max()
            .map(|seq| seq + 1)
            .unwrap_or(0);
        let entries = rows.into_iter().map(|(_, entry)| entry).collect();

        Ok(Self {
            store,
            workspace_salt: workspace_salt
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            inner: Mutex::new(AuditInner {
                entries,
                next_seq,
                current_tx: None,
                current_checkpoint: None,
                hash_field_names: true,
            }),
        })
    }

    /// Append a record. Arguments are redacted before the entry exists
    /// anywhere, including the returned copy.
    pub fn log(
        &self,
        op: &str,
        principal: &str,
        object: &str,
        args: Map<String, Value>,
        result: &str,
        provenance: Provenance,
        correlation_id: Option<String>,
    ) -> KernelResult<AuditEntry> {
        let mut inner = self.inner.lock();
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: epoch_now(),
            op: op.to_string(),
            principal: principal.to_string(),
            object: object.to_string(),
            args: self.redact_map(&args, inner.hash_field_names),
            result: result.to_string(),
            tx_id: inner.current_tx.clone(),
            checkpoint_id: inner.current_checkpoint.clone(),
            provenance,
            correlation_id,
        };

        // Durable write first; the mirror only advances on success.
        let seq = inner.next_seq;
        self.store
            .put(AUDIT_PREFIX, &format!("{:020}", seq), &entry)?;
        inner.next_seq = seq + 1;
        inner.entries.push(entry.clone());
        Ok(entry)
    }

    /// Associate subsequent entries with a transaction context.
    pub fn set_transaction_context(&self, tx_id: Option<String>, checkpoint_id: Option<String>) {
        let mut inner = self.inner.lock();
        inner.current_tx = tx_id;
        inner.current_checkpoint = checkpoint_id;
    }

    pub fn clear_transaction_context(&self) {
        self.set_transaction_context(None, None);
    }

    /// Query entries in ascending timestamp order.
    pub fn query(&self, filters: &AuditQuery) -> Vec<AuditEntry> {
        let inner = self.inner.lock();
        let limit = filters.limit.unwrap_or(1000);
        let mut matched: Vec<AuditEntry> = inner
            .entries
            .iter()
            .filter(|e| filters.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matched.truncate(limit);
        matched
    }

    /// Serialize the filtered entries as pretty JSON.
    pub fn export_json(&self, filters: &AuditQuery) -> KernelResult<String> {
        serde_json::to_string_pretty(&self.query(filters))
            .map_err(|e| KernelError::Internal(format!("audit export: {}", e)))
    }

    /// Parse entries previously produced by [`export_json`].
    pub fn import_json(data: &str) -> KernelResult<Vec<AuditEntry>> {
        serde_json::from_str(data).map_err(|e| KernelError::Internal(format!("audit import: {}", e)))
    }

    pub fn count(&self, filters: &AuditQuery) -> usize {
        self.query(filters).len()
    }

    /// All entries recorded under one transaction.
    pub fn transaction_log(&self, tx_id: &str) -> Vec<AuditEntry> {
        self.query(&AuditQuery::for_tx(tx_id))
    }

    /// Disable or re-enable PII field-name hashing (trusted debug builds).
    pub fn set_hash_field_names(&self, enabled: bool) {
        self.inner.lock().hash_field_names = enabled;
    }

    fn is_sensitive_key(key: &str) -> bool {
        let lower = key.to_ascii_lowercase();
        lower
            .split('_')
            .any(|segment| REDACT_KEYS.contains(&segment))
    }

    fn is_pii_field(key: &str) -> bool {
        let lower = key.to_ascii_lowercase();
        PII_FIELD_NAMES.iter().any(|pii| lower.contains(pii))
    }

    /// Salted SHA-256 of a field name, truncated to 8 hex chars.
    ///
    /// The salt is workspace-specific, so the same field hashes differently
    /// across workspaces and cannot be joined offline.
    fn hash_field_name(&self, field_name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(field_name.as_bytes());
        hasher.update(b":");
        hasher.update(self.workspace_salt.as_bytes());
        let digest = hasher.finalize();
        digest
            .iter()
            .take(4)
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn redact_map(&self, args: &Map<String, Value>, hash_pii: bool) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, value) in args {
            let sensitive = Self::is_sensitive_key(key);
            let pii = Self::is_pii_field(key);
            let out_key = if hash_pii && pii {
                format!("[PII:{}]", self.hash_field_name(key))
            } else {
                key.clone()
            };

            // PII field values are the PII itself, so they are redacted
            // along with the classic secret markers.
            if sensitive || (hash_pii && pii) {
                out.insert(out_key, Value::String(REDACTED.to_string()));
                continue;
            }

            match value {
                Value::Object(nested) => {
                    out.insert(out_key, Value::Object(self.redact_map(nested, hash_pii)));
                }
                Value::Array(items) if FIELD_LIST_KEYS.contains(&key.as_str()) && hash_pii => {
                    let hashed = items
                        .iter()
                        .map(|item| match item.as_str() {
                            Some(s) if Self::is_pii_field(s) => {
                                Value::String(format!("[PII:{}]", self.hash_field_name(s)))
                            }
                            _ => item.clone(),
                        })
                        .collect();
                    out.insert(out_key, Value::Array(hashed));
                }
                other => {
                    out.insert(out_key, other.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_log(salt: &str) -> (AuditLog, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KernelStore::open(dir.path().join("db")).unwrap());
        let log = AuditLog::open(store, Some(salt.to_string())).unwrap();
        (log, dir)
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn sensitive_values_are_redacted() {
        let (log, _dir) = test_log("s");
        let entry = log
            .log(
                "form.fill",
                "agent:1",
                "form:1",
                args(json!({
                    "password": "s3cret",
                    "api_key": "abc123",
                    "auth_token": "tok",
                    "username": "alice",
                })),
                "success",
                Provenance::Agent,
                None,
            )
            .unwrap();

        assert_eq!(entry.args["password"], REDACTED);
        assert_eq!(entry.args["api_key"], REDACTED);
        assert_eq!(entry.args["auth_token"], REDACTED);
        assert_eq!(entry.args["username"], "alice");
    }

    #[test]
    fn redaction_recurses_into_nested_maps() {
        let (log, _dir) = test_log("s");
        let entry = log
            .log(
                "workspace.update",
                "agent:1",
                "workspace:1",
                args(json!({"settings": {"secret": "x", "theme": "dark"}})),
                "success",
                Provenance::Agent,
                None,
            )
            .unwrap();

        let nested = entry.args["settings"].as_object().unwrap();
        assert_eq!(nested["secret"], REDACTED);
        assert_eq!(nested["theme"], "dark");
    }

    #[test]
    fn monkey_is_not_a_key() {
        // Segment matching: "monkey" does not end in a "_key" segment.
        assert!(!AuditLog::is_sensitive_key("monkey"));
        assert!(AuditLog::is_sensitive_key("api_key"));
        assert!(AuditLog::is_sensitive_key("KEY"));
    }

    #[test]
    fn pii_field_names_are_hashed_and_values_redacted() {
        let (log, _dir) = test_log("test-salt");
        let entry = log
            .log(
                "form.fill",
                "agent:1",
                "form:1",
                args(json!({"ssn": "123-45-6789", "email": "a@b"})),
                "success",
                Provenance::Agent,
                None,
            )
            .unwrap();

        assert!(!entry.args.contains_key("ssn"));
        let pii_key = entry
            .args
            .keys()
            .find(|k| k.starts_with("[PII:"))
            .expect("hashed key present");
        assert_eq!(pii_key.len(), "[PII:]".len() + 8);
        assert_eq!(entry.args[pii_key], REDACTED);
        assert_eq!(entry.args["email"], "a@b");
    }

    #[test]
    fn pii_hash_is_salted_and_stable() {
        let (log_a, _da) = test_log("salt-a");
        let (log_b, _db) = test_log("salt-b");
        assert_eq!(log_a.hash_field_name("ssn"), log_a.hash_field_name("ssn"));
        assert_ne!(log_a.hash_field_name("ssn"), log_b.hash_field_name("ssn"));
        assert_eq!(log_a.hash_field_name("ssn").len(), 8);
    }

    #[test]
    fn field_lists_hash_pii_elements() {
        let (log, _dir) = test_log("s");
        let entry = log
            .log(
                "form.fill",
                "agent:1",
                "form:1",
                args(json!({"fields": ["email", "ssn", "phone_number"]})),
                "success",
                Provenance::Agent,
                None,
            )
            .unwrap();

        let fields = entry.args["fields"].as_array().unwrap();
        assert_eq!(fields[0], "email");
        assert!(fields[1].as_str().unwrap().starts_with("[PII:"));
        assert!(fields[2].as_str().unwrap().starts_with("[PII:"));
    }

    #[test]
    fn pii_hashing_can_be_disabled() {
        let (log, _dir) = test_log("s");
        log.set_hash_field_names(false);
        let entry = log
            .log(
                "form.fill",
                "agent:1",
                "form:1",
                args(json!({"phone": "555-1234"})),
                "success",
                Provenance::Agent,
                None,
            )
            .unwrap();
        assert_eq!(entry.args["phone"], "555-1234");
    }

    #[test]
    fn query_filters_and_ordering() {
        let (log, _dir) = test_log("s");
        for i in 0..5 {
            log.log(
                if i % 2 == 0 { "tab.open" } else { "form.fill" },
                if i < 3 { "agent:a" } else { "agent:b" },
                &format!("tab:{}", i),
                Map::new(),
                "success",
                Provenance::Agent,
                None,
            )
            .unwrap();
        }

        let all = log.query(&AuditQuery::default());
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        assert_eq!(log.count(&AuditQuery::for_principal("agent:a")), 3);
        assert_eq!(log.count(&AuditQuery::for_op("tab.open")), 3);
        // Trailing '*' is a prefix match
        assert_eq!(log.count(&AuditQuery::for_op("tab.*")), 3);
        assert_eq!(log.count(&AuditQuery::for_op("t*")), 3);

        let limited = log.query(&AuditQuery {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let store = Arc::new(KernelStore::open(&path).unwrap());
            let log = AuditLog::open(store, Some("s".into())).unwrap();
            log.log(
                "tab.open",
                "agent:a",
                "tab:1",
                Map::new(),
                "success",
                Provenance::Agent,
                None,
            )
            .unwrap();
        }
        let store = Arc::new(KernelStore::open(&path).unwrap());
        let log = AuditLog::open(store, Some("s".into())).unwrap();
        let entries = log.query(&AuditQuery::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].op, "tab.open");
    }

    #[test]
    fn export_import_round_trip_is_stable() {
        let (log, _dir) = test_log("s");
        log.log(
            "tab.open",
            "agent:a",
            "tab:1",
            args(json!({"url": "https://example.com/"})),
            "success",
            Provenance::Agent,
            None,
        )
        .unwrap();

        let exported = log.export_json(&AuditQuery::default()).unwrap();
        let imported = AuditLog::import_json(&exported).unwrap();
        let re_exported = serde_json::to_string_pretty(&imported).unwrap();
        assert_eq!(exported, re_exported);
    }

    #[test]
    fn transaction_context_tags_entries() {
        let (log, _dir) = test_log("s");
        log.set_transaction_context(Some("tx:1".into()), None);
        let tagged = log
            .log("tab.open", "a", "tab:1", Map::new(), "success", Provenance::Agent, None)
            .unwrap();
        log.clear_transaction_context();
        let untagged = log
            .log("tab.open", "a", "tab:2", Map::new(), "success", Provenance::Agent, None)
            .unwrap();

        assert_eq!(tagged.tx_id.as_deref(), Some("tx:1"));
        assert_eq!(untagged.tx_id, None);
        assert_eq!(log.transaction_log("tx:1").len(), 1);
    }
}
