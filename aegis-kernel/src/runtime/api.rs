//! The `browser` API exposed to workflow code.
//!
//! This is the only handle a workflow has into the kernel. Every operation
//! requires a `<domain>.<verb>` capability on its target resource, delegates
//! state changes to the object manager, and is audited under the workflow's
//! principal with AGENT provenance. Nothing here touches the host.

use super::interp::{to_json, WfValue};
use crate::audit::AuditLog;
use crate::capability::CapabilityBroker;
use crate::error::{KernelError, KernelResult};
use crate::object::ObjectManager;
use crate::transaction::{TransactionCoordinator, TransactionGuard};
use aegis_types::structs::{ObjectRecord, ObjectType, Provenance};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Decides `human.approve` requests. The default provider denies everything;
/// an interactive surface may attach one that asks the human.
pub type ApprovalProvider = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct BrowserApi {
    principal: String,
    caps: Arc<CapabilityBroker>,
    objects: Arc<ObjectManager>,
    audit: Arc<AuditLog>,
    transactions: Arc<TransactionCoordinator>,
    approval: ApprovalProvider,
    /// Guards for transactions opened by this workflow. A guard left here
    /// when the workflow ends is dropped with the API, which aborts it.
    guards: Mutex<HashMap<String, TransactionGuard>>,
}

impl BrowserApi {
    pub fn new(
        principal: String,
        caps: Arc<CapabilityBroker>,
        objects: Arc<ObjectManager>,
        audit: Arc<AuditLog>,
        transactions: Arc<TransactionCoordinator>,
        approval: ApprovalProvider,
    ) -> Self {
        Self {
            principal,
            caps,
            objects,
            audit,
            transactions,
            approval,
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    fn require_cap(&self, operation: &str, resource: &str) -> KernelResult<()> {
        self.caps.require(&self.principal, operation, resource)
    }

    fn log(&self, op: &str, object: &str, args: Map<String, Value>, result: &str) -> KernelResult<()> {
        self.audit
            .log(op, &self.principal, object, args, result, Provenance::Agent, None)?;
        Ok(())
    }

    pub fn workflow_print(&self, line: &str) {
        debug!(target: "aegis::workflow", principal = %self.principal, "{}", line);
    }

    pub fn object_record(&self, id: &str) -> KernelResult<ObjectRecord> {
        self.objects.require(id)
    }

    /// Dispatch a call on a dotted API path.
    pub fn call(
        &self,
        path: &str,
        args: Vec<WfValue>,
        kwargs: BTreeMap<String, WfValue>,
    ) -> KernelResult<WfValue> {
        match path {
            "browser.Tab.open" => self.tab_open(&args, &kwargs),
            "browser.Tab.get" => self.tab_get(&args),
            "browser.Tab.list" => self.tab_list(),
            "browser.Tab.close" => self.tab_close(&args),
            "browser.Tab.navigate" => self.tab_navigate(&args),
            "browser.Tab.wait_for" => self.tab_wait_for(&args, &kwargs),
            "browser.Tab.extract" => self.tab_extract(&args, &kwargs),
            "browser.Form.find" => self.form_find(&args, &kwargs),
            "browser.Form.get" => self.form_get(&args),
            "browser.Form.fill" => self.form_fill(&args),
            "browser.Form.clear" => self.form_clear(&args),
            "browser.Form.submit" => self.form_submit(&args),
            "browser.Workspace.create" => self.workspace_create(&args),
            "browser.Workspace.get" => self.workspace_get(&args),
            "browser.Workspace.list" => self.workspace_list(),
            "browser.human.approve" => self.human_approve(&args),
            "browser.transaction" => self.begin_transaction(),
            other => Err(KernelError::Workflow(format!(
                "'{}' is not part of the workflow API",
                other
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // Tabs
    // ---------------------------------------------------------------------

    fn tab_open(
        &self,
        args: &[WfValue],
        _kwargs: &BTreeMap<String, WfValue>,
    ) -> KernelResult<WfValue> {
        let url = str_arg(args, 0, "Tab.open", "url")?;
        self.require_cap("tab.create", "*")?;
        let tab = self.objects.create_tab(&url, "")?;
        let mut log_args = Map::new();
        log_args.insert("url".into(), Value::String(url));
        self.log("tab.open", &tab.id, log_args, "success")?;
        Ok(WfValue::Object(tab.id))
    }

    fn tab_get(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let tab_id = str_arg(args, 0, "Tab.get", "tab_id")?;
        self.require_cap("tab.read", &tab_id)?;
        let tab = self.objects.require_typed(&tab_id, ObjectType::Tab)?;
        Ok(WfValue::Object(tab.id))
    }

    fn tab_list(&self) -> KernelResult<WfValue> {
        self.require_cap("tab.list", "*")?;
        Ok(WfValue::List(
            self.objects
                .list_by_type(ObjectType::Tab)
                .into_iter()
                .map(|t| WfValue::Object(t.id))
                .collect(),
        ))
    }

    fn tab_close(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let tab_id = str_arg(args, 0, "Tab.close", "tab_id")?;
        self.require_cap("tab.close", &tab_id)?;
        let closed = self.objects.delete(&tab_id)?;
        self.log(
            "tab.close",
            &tab_id,
            Map::new(),
            if closed { "success" } else { "not_found" },
        )?;
        Ok(WfValue::Bool(closed))
    }

    fn tab_navigate(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let tab_id = str_arg(args, 0, "Tab.navigate", "tab_id")?;
        let url = str_arg(args, 1, "Tab.navigate", "url")?;
        self.require_cap("tab.navigate", &tab_id)?;
        self.objects.navigate(&tab_id, &url)?;
        let mut log_args = Map::new();
        log_args.insert("url".into(), Value::String(url));
        self.log("tab.navigate", &tab_id, log_args, "success")?;
        Ok(WfValue::None)
    }

    fn tab_wait_for(
        &self,
        args: &[WfValue],
        kwargs: &BTreeMap<String, WfValue>,
    ) -> KernelResult<WfValue> {
        let tab_id = str_arg(args, 0, "Tab.wait_for", "tab_id")?;
        let state = opt_str(args, 1, kwargs, "state").unwrap_or_else(|| "interactive".to_string());
        self.require_cap("tab.read", &tab_id)?;
        self.objects.wait_for(&tab_id, &state)?;
        Ok(WfValue::None)
    }

    fn tab_extract(
        &self,
        args: &[WfValue],
        kwargs: &BTreeMap<String, WfValue>,
    ) -> KernelResult<WfValue> {
        let tab_id = str_arg(args, 0, "Tab.extract", "tab_id")?;
        let extract_type =
            opt_str(args, 1, kwargs, "extract_type").unwrap_or_else(|| "readable".to_string());
        self.require_cap("tab.read", &tab_id)?;
        let tab = self.objects.require_typed(&tab_id, ObjectType::Tab)?;
        let url = tab.field_str("url").unwrap_or_default().to_string();
        let title = tab.field_str("title").unwrap_or_default().to_string();

        let mut result = BTreeMap::new();
        result.insert("type".to_string(), WfValue::Str(extract_type.clone()));
        result.insert("url".to_string(), WfValue::Str(url.clone()));
        result.insert("title".to_string(), WfValue::Str(title));
        result.insert(
            "content".to_string(),
            WfValue::Str(format!("[{} content from {}]", extract_type, url)),
        );
        Ok(WfValue::Dict(result))
    }

    // ---------------------------------------------------------------------
    // Forms
    // ---------------------------------------------------------------------

    fn form_find(
        &self,
        args: &[WfValue],
        kwargs: &BTreeMap<String, WfValue>,
    ) -> KernelResult<WfValue> {
        let tab_id = str_arg(args, 0, "Form.find", "tab_id")?;
        let form_type = opt_str(args, 1, kwargs, "form_type").unwrap_or_default();
        self.require_cap("form.read", &format!("{}:*", tab_id))?;
        let form = self.objects.create_form(&tab_id, &form_type)?;
        let mut log_args = Map::new();
        log_args.insert("tab_id".into(), Value::String(tab_id));
        log_args.insert("type".into(), Value::String(form_type));
        self.log("form.find", &form.id, log_args, "found")?;
        Ok(WfValue::Object(form.id))
    }

    fn form_get(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let form_id = str_arg(args, 0, "Form.get", "form_id")?;
        self.require_cap("form.read", &form_id)?;
        let form = self.objects.require_typed(&form_id, ObjectType::Form)?;
        Ok(WfValue::Object(form.id))
    }

    fn form_fill(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let form_id = str_arg(args, 0, "Form.fill", "form_id")?;
        let values = match args.get(1) {
            Some(WfValue::Dict(entries)) => entries.clone(),
            _ => {
                return Err(KernelError::Workflow(
                    "Form.fill() takes a dict of values".into(),
                ))
            }
        };
        self.require_cap("form.fill", &form_id)?;

        let mut json_values = Map::new();
        for (k, v) in &values {
            json_values.insert(k.clone(), to_json(v));
        }
        self.objects.fill_form(&form_id, json_values)?;

        // Only field names reach the log; the values themselves never do.
        let mut log_args = Map::new();
        log_args.insert(
            "fields".into(),
            Value::Array(values.keys().map(|k| Value::String(k.clone())).collect()),
        );
        self.log("form.fill", &form_id, log_args, "success")?;
        Ok(WfValue::None)
    }

    fn form_clear(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let form_id = str_arg(args, 0, "Form.clear", "form_id")?;
        self.require_cap("form.fill", &form_id)?;
        self.objects.clear_form(&form_id)?;
        self.log("form.clear", &form_id, Map::new(), "success")?;
        Ok(WfValue::None)
    }

    fn form_submit(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let form_id = str_arg(args, 0, "Form.submit", "form_id")?;
        self.require_cap("form.submit", &form_id)?;
        self.objects.require_typed(&form_id, ObjectType::Form)?;
        self.log("form.submit", &form_id, Map::new(), "success")?;

        let mut result = BTreeMap::new();
        result.insert("submitted".to_string(), WfValue::Bool(true));
        result.insert("form_id".to_string(), WfValue::Str(form_id));
        Ok(WfValue::Dict(result))
    }

    // ---------------------------------------------------------------------
    // Workspaces
    // ---------------------------------------------------------------------

    fn workspace_create(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let name = str_arg(args, 0, "Workspace.create", "name")?;
        self.require_cap("workspace.create", "*")?;
        let workspace = self.objects.create_workspace(&name)?;
        let mut log_args = Map::new();
        log_args.insert("name".into(), Value::String(name));
        self.log("workspace.create", &workspace.id, log_args, "success")?;
        Ok(WfValue::Object(workspace.id))
    }

    fn workspace_get(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let workspace_id = str_arg(args, 0, "Workspace.get", "workspace_id")?;
        self.require_cap("workspace.read", &workspace_id)?;
        let workspace = self
            .objects
            .require_typed(&workspace_id, ObjectType::Workspace)?;
        Ok(WfValue::Object(workspace.id))
    }

    fn workspace_list(&self) -> KernelResult<WfValue> {
        self.require_cap("workspace.list", "*")?;
        Ok(WfValue::List(
            self.objects
                .list_by_type(ObjectType::Workspace)
                .into_iter()
                .map(|w| WfValue::Object(w.id))
                .collect(),
        ))
    }

    // ---------------------------------------------------------------------
    // Human-in-the-loop
    // ---------------------------------------------------------------------

    /// The only path by which an IRREVERSIBLE action may be conditionally
    /// gated inside a workflow. Both the request and the decision are
    /// audited; without an attached provider the answer is always no.
    fn human_approve(&self, args: &[WfValue]) -> KernelResult<WfValue> {
        let message = str_arg(args, 0, "human.approve", "message")?;
        let mut log_args = Map::new();
        log_args.insert("message".into(), Value::String(message.clone()));
        self.log("human.approve", "user", log_args, "requested")?;

        let approved = (self.approval)(&message);
        self.log(
            "human.approve",
            "user",
            Map::new(),
            if approved { "approved" } else { "denied" },
        )?;
        Ok(WfValue::Bool(approved))
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    fn begin_transaction(&self) -> KernelResult<WfValue> {
        let guard = self.transactions.begin()?;
        let tx_id = guard.id().to_string();
        self.guards.lock().insert(tx_id.clone(), guard);
        Ok(WfValue::Transaction(tx_id))
    }

    pub fn tx_checkpoint(&self, tx_id: &str, name: &str) -> KernelResult<String> {
        Ok(self.transactions.checkpoint(tx_id, name)?.id)
    }

    pub fn tx_rollback(&self, tx_id: &str, name: &str) -> KernelResult<()> {
        self.transactions.rollback(tx_id, name)
    }

    pub fn tx_commit(&self, tx_id: &str) -> KernelResult<()> {
        let mut guard = self
            .guards
            .lock()
            .remove(tx_id)
            .ok_or_else(|| KernelError::TransactionNotActive(tx_id.to_string()))?;
        guard.commit()
    }

    pub fn tx_abort(&self, tx_id: &str) -> KernelResult<()> {
        let mut guard = self
            .guards
            .lock()
            .remove(tx_id)
            .ok_or_else(|| KernelError::TransactionNotActive(tx_id.to_string()))?;
        guard.abort()
    }

    pub fn tx_is_active(&self, tx_id: &str) -> bool {
        self.guards.lock().contains_key(tx_id)
    }
}

fn str_arg(args: &[WfValue], index: usize, func: &str, name: &str) -> KernelResult<String> {
    match args.get(index) {
        Some(WfValue::Str(s)) => Ok(s.clone()),
        Some(WfValue::Object(id)) => Ok(id.clone()),
        Some(other) => Err(KernelError::Workflow(format!(
            "{}() expects {} to be a string, got {}",
            func,
            name,
            other.type_name()
        ))),
        None => Err(KernelError::Workflow(format!(
            "{}() is missing required argument '{}'",
            func, name
        ))),
    }
}

fn opt_str(
    args: &[WfValue],
    index: usize,
    kwargs: &BTreeMap<String, WfValue>,
    name: &str,
) -> Option<String> {
    if let Some(WfValue::Str(s)) = args.get(index) {
        return Some(s.clone());
    }
    if let Some(WfValue::Str(s)) = kwargs.get(name) {
        return Some(s.clone());
    }
    None
}
