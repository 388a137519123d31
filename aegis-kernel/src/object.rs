//! Canonical registry of managed resources with stable ids.
//!
//! Every resource the kernel mediates (tabs, forms, workspaces, ...) lives
//! here under a stable `"<type>:<n>"` id. The registry owns the objects
//! exclusively; everything else sees cloned records or snapshots.
//!
//! Object `data` sits behind an `Arc`, so a graph snapshot is a map of `Arc`
//! clones rather than deep copies. A mutation clones the map only when a
//! snapshot still shares it (`Arc::make_mut`), which keeps `snapshot_all`
//! within its time and allocation envelope on unchanged graphs.

use crate::audit::AuditLog;
use crate::error::{KernelError, KernelResult};
use aegis_types::structs::{epoch_now, ObjectRecord, ObjectType, Provenance};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Immutable value snapshot of a single object.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    pub id: String,
    pub object_type: ObjectType,
    pub data: Arc<Map<String, Value>>,
    pub timestamp: f64,
}

/// Snapshot of every live object at the moment of capture.
pub type GraphSnapshot = HashMap<String, ObjectSnapshot>;

/// A managed object. `data` is a free-form mapping; type-specific shapes
/// (tab urls, form fill buffers) are conventions, not enforced schemas.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    pub id: String,
    pub object_type: ObjectType,
    data: Arc<Map<String, Value>>,
    pub created_at: f64,
    pub updated_at: f64,
}

impl ManagedObject {
    fn new(id: String, object_type: ObjectType, data: Map<String, Value>) -> Self {
        let now = epoch_now();
        Self {
            id,
            object_type,
            data: Arc::new(data),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        Arc::make_mut(&mut self.data).insert(key.to_string(), value);
        self.updated_at = epoch_now();
    }

    fn merge(&mut self, fields: Map<String, Value>) {
        let data = Arc::make_mut(&mut self.data);
        for (key, value) in fields {
            data.insert(key, value);
        }
        self.updated_at = epoch_now();
    }

    pub fn snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            id: self.id.clone(),
            object_type: self.object_type,
            data: Arc::clone(&self.data),
            timestamp: epoch_now(),
        }
    }

    fn restore(&mut self, state: &ObjectSnapshot) -> KernelResult<()> {
        if state.id != self.id || state.object_type != self.object_type {
            return Err(KernelError::Internal(format!(
                "snapshot mismatch: {} vs {}",
                state.id, self.id
            )));
        }
        self.data = Arc::clone(&state.data);
        self.updated_at = epoch_now();
        Ok(())
    }

    pub fn to_record(&self) -> ObjectRecord {
        ObjectRecord {
            id: self.id.clone(),
            object_type: self.object_type,
            data: (*self.data).clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

type Listener = Box<dyn Fn(&str, &ObjectRecord) + Send + Sync>;

/// Canonical registry of managed resources.
pub struct ObjectManager {
    objects: RwLock<HashMap<String, ManagedObject>>,
    counters: Mutex<HashMap<ObjectType, u64>>,
    listeners: RwLock<Vec<Listener>>,
    audit: Arc<AuditLog>,
}

impl ObjectManager {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            audit,
        }
    }

    /// Next stable id for a type. Counters only ever advance; deleting an
    /// object never frees its id.
    fn next_id(&self, object_type: ObjectType) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(object_type).or_insert(0);
        *counter += 1;
        format!("{}:{}", object_type.as_str(), counter)
    }

    /// Create and register a new object with the given initial fields.
    pub fn create(
        &self,
        object_type: ObjectType,
        fields: Map<String, Value>,
    ) -> KernelResult<ObjectRecord> {
        let id = self.next_id(object_type);
        let object = ManagedObject::new(id.clone(), object_type, fields.clone());
        let record = object.to_record();
        self.objects.write().insert(id.clone(), object);

        self.audit.log(
            &format!("{}.create", object_type.as_str()),
            "system",
            &id,
            fields,
            "created",
            Provenance::System,
            None,
        )?;
        Ok(record)
    }

    /// Create a tab with the conventional field skeleton.
    pub fn create_tab(&self, url: &str, title: &str) -> KernelResult<ObjectRecord> {
        let mut fields = Map::new();
        fields.insert("url".into(), Value::String(url.to_string()));
        fields.insert("title".into(), Value::String(title.to_string()));
        fields.insert("load_state".into(), Value::String("idle".to_string()));
        fields.insert("workspace".into(), Value::Null);
        self.create(ObjectType::Tab, fields)
    }

    pub fn create_form(&self, tab_id: &str, form_type: &str) -> KernelResult<ObjectRecord> {
        let mut fields = Map::new();
        fields.insert("tab_id".into(), Value::String(tab_id.to_string()));
        fields.insert("form_type".into(), Value::String(form_type.to_string()));
        fields.insert("fields".into(), Value::Object(Map::new()));
        fields.insert("filled".into(), Value::Object(Map::new()));
        self.create(ObjectType::Form, fields)
    }

    pub fn create_workspace(&self, name: &str) -> KernelResult<ObjectRecord> {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String(name.to_string()));
        fields.insert("tabs".into(), Value::Array(Vec::new()));
        fields.insert("storage".into(), Value::Object(Map::new()));
        fields.insert("policies".into(), Value::Object(Map::new()));
        self.create(ObjectType::Workspace, fields)
    }

    pub fn get(&self, id: &str) -> Option<ObjectRecord> {
        self.objects.read().get(id).map(ManagedObject::to_record)
    }

    pub fn require(&self, id: &str) -> KernelResult<ObjectRecord> {
        self.get(id)
            .ok_or_else(|| KernelError::ObjectNotFound(id.to_string()))
    }

    /// Fetch an object, also checking its type.
    pub fn require_typed(&self, id: &str, expected: ObjectType) -> KernelResult<ObjectRecord> {
        let record = self.require(id)?;
        if record.object_type != expected {
            return Err(KernelError::WrongObjectType {
                id: id.to_string(),
                expected,
            });
        }
        Ok(record)
    }

    pub fn delete(&self, id: &str) -> KernelResult<bool> {
        let removed = self.objects.write().remove(id);
        match removed {
            Some(object) => {
                self.audit.log(
                    &format!("{}.delete", object.object_type.as_str()),
                    "system",
                    id,
                    Map::new(),
                    "deleted",
                    Provenance::System,
                    None,
                )?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list_by_type(&self, object_type: ObjectType) -> Vec<ObjectRecord> {
        let mut records: Vec<ObjectRecord> = self
            .objects
            .read()
            .values()
            .filter(|o| o.object_type == object_type)
            .map(ManagedObject::to_record)
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn list_all(&self) -> Vec<ObjectRecord> {
        let mut records: Vec<ObjectRecord> = self
            .objects
            .read()
            .values()
            .map(ManagedObject::to_record)
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Query objects by optional type and exact-match data filters.
    pub fn query(
        &self,
        object_type: Option<ObjectType>,
        filters: &Map<String, Value>,
    ) -> Vec<ObjectRecord> {
        self.objects
            .read()
            .values()
            .filter(|o| object_type.map_or(true, |t| o.object_type == t))
            .filter(|o| filters.iter().all(|(k, v)| o.get(k) == Some(v)))
            .map(ManagedObject::to_record)
            .collect()
    }

    /// Set a single data field.
    pub fn set_field(&self, id: &str, key: &str, value: Value) -> KernelResult<()> {
        self.mutate(id, |object| {
            object.set(key, value);
            Ok(())
        })
    }

    /// Merge several data fields at once.
    pub fn merge_fields(&self, id: &str, fields: Map<String, Value>) -> KernelResult<()> {
        self.mutate(id, |object| {
            object.merge(fields);
            Ok(())
        })
    }

    /// Point a tab at a new URL and mark it loading.
    pub fn navigate(&self, tab_id: &str, url: &str) -> KernelResult<()> {
        self.mutate_typed(tab_id, ObjectType::Tab, |object| {
            object.set("url", Value::String(url.to_string()));
            object.set("load_state", Value::String("loading".to_string()));
            Ok(())
        })
    }

    /// Advance a tab's load state.
    pub fn wait_for(&self, tab_id: &str, state: &str) -> KernelResult<()> {
        self.mutate_typed(tab_id, ObjectType::Tab, |object| {
            object.set("load_state", Value::String(state.to_string()));
            Ok(())
        })
    }

    /// Merge values into a form's fill buffer.
    pub fn fill_form(&self, form_id: &str, values: Map<String, Value>) -> KernelResult<()> {
        self.mutate_typed(form_id, ObjectType::Form, |object| {
            let mut filled = match object.get("filled") {
                Some(Value::Object(m)) => m.clone(),
                _ => Map::new(),
            };
            for (k, v) in values {
                filled.insert(k, v);
            }
            object.set("filled", Value::Object(filled));
            Ok(())
        })
    }

    /// Drop everything from a form's fill buffer.
    pub fn clear_form(&self, form_id: &str) -> KernelResult<()> {
        self.mutate_typed(form_id, ObjectType::Form, |object| {
            object.set("filled", Value::Object(Map::new()));
            Ok(())
        })
    }

    pub fn workspace_add_tab(&self, workspace_id: &str, tab_id: &str) -> KernelResult<()> {
        self.mutate_typed(workspace_id, ObjectType::Workspace, |object| {
            let mut tabs = match object.get("tabs") {
                Some(Value::Array(t)) => t.clone(),
                _ => Vec::new(),
            };
            if !tabs.iter().any(|t| t.as_str() == Some(tab_id)) {
                tabs.push(Value::String(tab_id.to_string()));
                object.set("tabs", Value::Array(tabs));
            }
            Ok(())
        })
    }

    pub fn workspace_remove_tab(&self, workspace_id: &str, tab_id: &str) -> KernelResult<()> {
        self.mutate_typed(workspace_id, ObjectType::Workspace, |object| {
            let mut tabs = match object.get("tabs") {
                Some(Value::Array(t)) => t.clone(),
                _ => Vec::new(),
            };
            tabs.retain(|t| t.as_str() != Some(tab_id));
            object.set("tabs", Value::Array(tabs));
            Ok(())
        })
    }

    /// Snapshot every live object. Cheap when the graph is unchanged: each
    /// entry is an `Arc` clone of the object's data.
    pub fn snapshot_all(&self) -> GraphSnapshot {
        self.objects
            .read()
            .iter()
            .map(|(id, object)| (id.clone(), object.snapshot()))
            .collect()
    }

    /// Restore objects from a snapshot.
    ///
    /// Only ids still present in the live graph are touched: objects deleted
    /// since the snapshot are not resurrected, and objects created after it
    /// are left alone. The transaction coordinator relies on the initial
    /// snapshot being complete at `begin` for abort semantics.
    pub fn restore_snapshot(&self, snapshot: &GraphSnapshot) {
        let mut objects = self.objects.write();
        for (id, state) in snapshot {
            if let Some(object) = objects.get_mut(id) {
                if let Err(e) = object.restore(state) {
                    warn!(target: "aegis", "restore skipped for {}: {}", id, e);
                }
            }
        }
    }

    /// Register a listener for object updates. Listeners are best-effort
    /// and fire synchronously after each mutation; a panicking listener is
    /// isolated and does not affect the mutation.
    pub fn add_listener(&self, listener: impl Fn(&str, &ObjectRecord) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut ManagedObject) -> KernelResult<()>,
    ) -> KernelResult<()> {
        let record = {
            let mut objects = self.objects.write();
            let object = objects
                .get_mut(id)
                .ok_or_else(|| KernelError::ObjectNotFound(id.to_string()))?;
            f(object)?;
            object.to_record()
        };
        self.notify_update(&record);
        Ok(())
    }

    fn mutate_typed(
        &self,
        id: &str,
        expected: ObjectType,
        f: impl FnOnce(&mut ManagedObject) -> KernelResult<()>,
    ) -> KernelResult<()> {
        let record = {
            let mut objects = self.objects.write();
            let object = objects
                .get_mut(id)
                .ok_or_else(|| KernelError::ObjectNotFound(id.to_string()))?;
            if object.object_type != expected {
                return Err(KernelError::WrongObjectType {
                    id: id.to_string(),
                    expected,
                });
            }
            f(object)?;
            object.to_record()
        };
        self.notify_update(&record);
        Ok(())
    }

    fn notify_update(&self, record: &ObjectRecord) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener("update", record))).is_err() {
                warn!(target: "aegis", "object listener panicked for {}", record.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KernelStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (ObjectManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KernelStore::open(dir.path().join("db")).unwrap());
        let audit = Arc::new(AuditLog::open(store, Some("s".into())).unwrap());
        (ObjectManager::new(audit), dir)
    }

    #[test]
    fn ids_are_stable_and_never_reused() {
        let (objects, _dir) = manager();
        let a = objects.create_tab("https://a/", "").unwrap();
        let b = objects.create_tab("https://b/", "").unwrap();
        assert_eq!(a.id, "tab:1");
        assert_eq!(b.id, "tab:2");

        assert!(objects.delete(&b.id).unwrap());
        let c = objects.create_tab("https://c/", "").unwrap();
        assert_eq!(c.id, "tab:3");
    }

    #[test]
    fn counters_are_per_type() {
        let (objects, _dir) = manager();
        let tab = objects.create_tab("https://a/", "").unwrap();
        let form = objects.create_form(&tab.id, "login").unwrap();
        assert_eq!(tab.id, "tab:1");
        assert_eq!(form.id, "form:1");
    }

    #[test]
    fn snapshot_shares_data_until_mutation() {
        let (objects, _dir) = manager();
        let tab = objects.create_tab("https://a/", "").unwrap();
        let snapshot = objects.snapshot_all();

        objects.navigate(&tab.id, "https://b/").unwrap();

        // Snapshot still sees the pre-mutation value.
        let state = &snapshot[&tab.id];
        assert_eq!(state.data.get("url").unwrap(), "https://a/");
        assert_eq!(
            objects.get(&tab.id).unwrap().field_str("url"),
            Some("https://b/")
        );
    }

    #[test]
    fn restore_does_not_resurrect_or_prune() {
        let (objects, _dir) = manager();
        let kept = objects.create_tab("https://kept/", "").unwrap();
        let doomed = objects.create_tab("https://doomed/", "").unwrap();
        let snapshot = objects.snapshot_all();

        objects.navigate(&kept.id, "https://changed/").unwrap();
        objects.delete(&doomed.id).unwrap();
        let late = objects.create_tab("https://late/", "").unwrap();

        objects.restore_snapshot(&snapshot);

        assert_eq!(
            objects.get(&kept.id).unwrap().field_str("url"),
            Some("https://kept/")
        );
        assert!(objects.get(&doomed.id).is_none());
        assert!(objects.get(&late.id).is_some());
    }

    #[test]
    fn query_filters_on_data() {
        let (objects, _dir) = manager();
        objects.create_tab("https://a/", "").unwrap();
        objects.create_tab("https://b/", "").unwrap();

        let filters = json!({"url": "https://a/"}).as_object().unwrap().clone();
        let hits = objects.query(Some(ObjectType::Tab), &filters);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field_str("url"), Some("https://a/"));
    }

    #[test]
    fn form_fill_and_clear() {
        let (objects, _dir) = manager();
        let tab = objects.create_tab("https://a/", "").unwrap();
        let form = objects.create_form(&tab.id, "login").unwrap();

        let values = json!({"email": "a@b"}).as_object().unwrap().clone();
        objects.fill_form(&form.id, values).unwrap();
        let filled = objects.get(&form.id).unwrap();
        assert_eq!(filled.data["filled"]["email"], "a@b");

        objects.clear_form(&form.id).unwrap();
        let cleared = objects.get(&form.id).unwrap();
        assert!(cleared.data["filled"].as_object().unwrap().is_empty());
    }

    #[test]
    fn listener_panic_is_isolated() {
        let (objects, _dir) = manager();
        objects.add_listener(|_, _| panic!("listener bug"));
        let tab = objects.create_tab("https://a/", "").unwrap();
        // The mutation must survive the panicking listener.
        objects.navigate(&tab.id, "https://b/").unwrap();
        assert_eq!(
            objects.get(&tab.id).unwrap().field_str("url"),
            Some("https://b/")
        );
    }

    #[test]
    fn wrong_type_is_rejected() {
        let (objects, _dir) = manager();
        let tab = objects.create_tab("https://a/", "").unwrap();
        let err = objects.fill_form(&tab.id, Map::new()).unwrap_err();
        assert!(matches!(err, KernelError::WrongObjectType { .. }));
    }
}
