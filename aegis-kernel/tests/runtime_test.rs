mod common;

use aegis_kernel::audit::AuditQuery;
use aegis_types::structs::{CapabilityRisk, ExecutionState, TransactionState};
use common::{open_kernel, open_kernel_with_timeout};
use std::error::Error;
use std::sync::Arc;

/// A principal holding only `tab.*` opens a tab, then trips over
/// `form.submit`: execution fails with a capability denial, the denial is
/// audited, and no form state exists.
#[test]
fn denied_operation_fails_the_workflow() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    let code = "\
t = browser.Tab.open(\"https://x/\")
browser.Form.submit(\"form:1\")
";
    let outcome = kernel.runtime.execute(code, "agent:a");

    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("capability_denied"));
    let error = outcome.error.unwrap();
    assert!(error.contains("agent:a"));
    assert!(error.contains("form.submit"));
    assert!(error.contains("form:1"));

    // One successful tab.open, one denied check for form.submit.
    let opens = kernel.audit.query(&AuditQuery::for_op("tab.open"));
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].result, "success");

    let denials: Vec<_> = kernel
        .audit
        .query(&AuditQuery::for_op("capability.check"))
        .into_iter()
        .filter(|e| e.result == "denied")
        .collect();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].object, "form:1");

    // No form object was created or mutated.
    assert!(kernel.objects.get("form:1").is_none());
    Ok(())
}

#[test]
fn completed_workflow_returns_result_binding() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    let code = "\
t = browser.Tab.open(\"https://x/\")
browser.Tab.navigate(t, \"https://y/\")
__result__ = t.url
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Completed);
    assert_eq!(outcome.return_value.unwrap(), "https://y/");
    Ok(())
}

#[test]
fn validation_rejects_blocked_imports_before_running() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();

    let outcome = kernel
        .runtime
        .execute("import os\nt = browser.Tab.open(\"https://x/\")\n", "agent:a");
    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("validation"));
    assert!(outcome.error.unwrap().contains("blocked import: os"));

    // Nothing executed: no audit entries were created for the workflow.
    assert_eq!(kernel.audit.count(&AuditQuery::for_principal("agent:a")), 0);
    Ok(())
}

#[test]
fn validate_reports_syntax_errors_with_position() {
    let (kernel, _dir) = open_kernel();
    let errors = kernel.runtime.validate("t = = 1\n");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("syntax error"));
    assert!(errors[0].contains("line 1"));
}

#[test]
fn empty_source_validates_and_completes() {
    let (kernel, _dir) = open_kernel();
    assert!(kernel.runtime.validate("").is_empty());

    let outcome = kernel.runtime.execute("", "agent:a");
    assert_eq!(outcome.state, ExecutionState::Completed);
    assert!(outcome.return_value.is_none());
}

#[test]
fn runaway_loop_times_out() {
    let (kernel, _dir) = open_kernel_with_timeout(0.05);
    let outcome = kernel.runtime.execute("while True:\n    x = 1\n", "agent:a");
    assert_eq!(outcome.state, ExecutionState::Timeout);
    assert!(outcome.error.unwrap().contains("timed out"));
    assert!(outcome.duration_ms >= 50.0);
}

#[test]
fn human_approval_denies_by_default() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "form.*", "*", CapabilityRisk::Irreversible, None, None)?;
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    let code = "\
t = browser.Tab.open(\"https://x/\")
f = browser.Form.find(t, \"payment\")
if browser.human.approve(\"submit payment form?\"):
    browser.Form.submit(f)
__result__ = \"done\"
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Completed);

    // Request and decision are both audited; the submit never happened.
    let approvals = kernel.audit.query(&AuditQuery::for_op("human.approve"));
    assert_eq!(approvals.len(), 2);
    assert_eq!(approvals[0].result, "requested");
    assert_eq!(approvals[1].result, "denied");
    assert_eq!(kernel.audit.count(&AuditQuery::for_op("form.submit")), 0);
    Ok(())
}

#[test]
fn attached_approval_provider_allows_submit() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "form.*", "*", CapabilityRisk::Irreversible, None, None)?;
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;
    kernel.set_approval_provider(Arc::new(|_message: &str| true));

    let code = "\
t = browser.Tab.open(\"https://x/\")
f = browser.Form.find(t, \"payment\")
if browser.human.approve(\"submit payment form?\"):
    __result__ = browser.Form.submit(f)
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Completed);
    assert_eq!(outcome.return_value.unwrap()["submitted"], true);
    assert_eq!(kernel.audit.count(&AuditQuery::for_op("form.submit")), 1);
    Ok(())
}

/// The login scenario: checkpoint before filling, fill with credentials,
/// roll back instead of submitting. The fill buffer is empty afterwards and
/// no secret value reaches the audit log.
#[test]
fn checkpoint_fill_rollback_inside_workflow() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:login", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;
    kernel
        .caps
        .grant("agent:login", "form.*", "*", CapabilityRisk::Stateful, None, None)?;

    let code = "\
t = browser.Tab.open(\"about:blank\")
browser.Tab.navigate(t, \"https://example.com/login\")
f = browser.Form.find(t, \"login\")
with browser.transaction() as tx:
    tx.checkpoint(\"before-fill\")
    browser.Form.fill(f, {
        \"email\": \"test@example.com\",
        \"password\": \"supersecret123\",
    })
    tx.rollback(\"before-fill\")
    tx.commit()
__result__ = f.filled
";
    let outcome = kernel.runtime.execute(code, "agent:login");
    assert_eq!(outcome.state, ExecutionState::Completed);
    assert_eq!(outcome.return_value.unwrap(), serde_json::json!({}));

    // The fill was audited by field name only; the password never appears.
    let fills = kernel.audit.query(&AuditQuery::for_op("form.fill"));
    assert_eq!(fills.len(), 1);
    let serialized = serde_json::to_string(&fills)?;
    assert!(!serialized.contains("supersecret123"));
    Ok(())
}

/// A workflow error inside `with browser.transaction()` aborts the
/// transaction and rolls the graph back to its state at begin.
#[test]
fn error_inside_transaction_scope_aborts() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    let code = "\
t = browser.Tab.open(\"https://a/\")
with browser.transaction() as tx:
    browser.Tab.navigate(t, \"https://b/\")
    browser.Form.submit(\"form:99\")
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("capability_denied"));

    // The navigate inside the transaction was rolled back.
    let tabs = kernel.objects.list_by_type(aegis_types::structs::ObjectType::Tab);
    assert_eq!(tabs.len(), 1);
    assert_eq!(tabs[0].field_str("url"), Some("https://a/"));

    let begins = kernel.audit.query(&AuditQuery::for_op("transaction.begin"));
    let tx_id = begins.last().unwrap().object.clone();
    assert_eq!(
        kernel.transactions.state_of(&tx_id),
        Some(TransactionState::Aborted)
    );
    let entries = kernel.audit.transaction_log(&tx_id);
    assert_eq!(entries.first().unwrap().op, "transaction.begin");
    assert_eq!(entries.last().unwrap().op, "transaction.abort");
    Ok(())
}

#[test]
fn dangling_transaction_is_aborted_when_execution_ends() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    // Transaction opened without `with` and never committed.
    let code = "\
t = browser.Tab.open(\"https://a/\")
tx = browser.transaction()
browser.Tab.navigate(t, \"https://b/\")
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Completed);

    let tabs = kernel.objects.list_by_type(aegis_types::structs::ObjectType::Tab);
    assert_eq!(tabs[0].field_str("url"), Some("https://a/"));
    assert!(kernel.transactions.active_transaction().is_none());
    Ok(())
}

#[test]
fn incompatible_version_header_refuses_execution() {
    let (kernel, _dir) = open_kernel();
    let code = "\
# @workflow name: future-flow
# @workflow version: 1.0.0
# @workflow min_kernel_version: 99.0.0
t = browser.Tab.open(\"https://x/\")
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Failed);
    assert_eq!(outcome.error_kind.as_deref(), Some("version"));
    assert!(outcome.error.unwrap().contains("requires kernel >= 99.0.0"));
}

#[test]
fn compatible_version_header_executes() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    let code = "\
# @workflow name: current-flow
# @workflow version: 1.0.0
# @workflow min_kernel_version: 0.1.0
__result__ = browser.Tab.open(\"https://x/\").id
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Completed);
    assert_eq!(outcome.return_value.unwrap(), "tab:1");
    Ok(())
}

#[test]
fn control_flow_and_builtins_work() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    let code = "\
urls = [\"https://a/\", \"https://b/\", \"https://c/\"]
opened = []
for url in urls:
    t = browser.Tab.open(url)
    opened = opened + [t.id]
count = 0
while count < 2:
    count = count + 1
__result__ = {\"opened\": len(opened), \"count\": count}
";
    let outcome = kernel.runtime.execute(code, "agent:a");
    assert_eq!(outcome.state, ExecutionState::Completed);
    let value = outcome.return_value.unwrap();
    assert_eq!(value["opened"], 3);
    assert_eq!(value["count"], 2);
    Ok(())
}

#[test]
fn workflow_operations_carry_agent_provenance() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    kernel
        .caps
        .grant("agent:a", "tab.*", "*", CapabilityRisk::Stateful, None, None)?;

    kernel
        .runtime
        .execute("t = browser.Tab.open(\"https://x/\")\n", "agent:a");

    let opens = kernel.audit.query(&AuditQuery::for_op("tab.open"));
    assert_eq!(opens[0].principal, "agent:a");
    assert_eq!(opens[0].provenance, aegis_types::structs::Provenance::Agent);
    Ok(())
}
