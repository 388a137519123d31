//! Sandboxed workflow runtime.
//!
//! Accepts a workflow source string and a principal, statically validates the
//! source, and executes it against the restricted `browser` API under a
//! wall-clock budget. The workflow never touches the host: nothing dangerous
//! is linked into its environment, and sources that try to import their way
//! out are rejected before execution.

pub mod api;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod validate;

pub use api::{ApprovalProvider, BrowserApi};
pub use validate::BLOCKED_IMPORTS;

use crate::audit::AuditLog;
use crate::capability::CapabilityBroker;
use crate::error::KernelError;
use crate::object::ObjectManager;
use crate::transaction::TransactionCoordinator;
use crate::version::{parse_workflow_header, VersionCompatibility, KERNEL_VERSION};
use aegis_types::structs::ExecutionOutcome;
use interp::{to_json, Interpreter, WfValue};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Executes workflow code under capability mediation.
pub struct WorkflowRuntime {
    caps: Arc<CapabilityBroker>,
    objects: Arc<ObjectManager>,
    audit: Arc<AuditLog>,
    transactions: Arc<TransactionCoordinator>,
    timeout: Duration,
    approval: RwLock<ApprovalProvider>,
}

impl WorkflowRuntime {
    pub fn new(
        caps: Arc<CapabilityBroker>,
        objects: Arc<ObjectManager>,
        audit: Arc<AuditLog>,
        transactions: Arc<TransactionCoordinator>,
        timeout_secs: f64,
    ) -> Self {
        Self {
            caps,
            objects,
            audit,
            transactions,
            timeout: Duration::from_secs_f64(timeout_secs),
            approval: RwLock::new(Arc::new(|_message: &str| false)),
        }
    }

    /// Attach an approval provider for `human.approve`. Without one, every
    /// request is denied.
    pub fn set_approval_provider(&self, provider: ApprovalProvider) {
        *self.approval.write() = provider;
    }

    /// Statically validate workflow source. Empty result means valid.
    pub fn validate(&self, code: &str) -> Vec<String> {
        validate::validate_source(code)
    }

    /// Execute workflow code under the given principal.
    ///
    /// Validation failures are returned before anything runs; capability
    /// denials and script errors come back as FAILED with a typed reason;
    /// exceeding the wall-clock budget yields TIMEOUT. Transactions still
    /// open when execution ends are aborted.
    pub fn execute(&self, code: &str, principal: &str) -> ExecutionOutcome {
        let started = Instant::now();

        if let Some(metadata) = parse_workflow_header(code) {
            let (compatibility, message) = metadata.check_compatibility(KERNEL_VERSION);
            match compatibility {
                VersionCompatibility::Incompatible => {
                    return ExecutionOutcome::failed(message, "version", elapsed_ms(started));
                }
                VersionCompatibility::Deprecated => {
                    warn!(target: "aegis", workflow = %metadata.name, "{}", message);
                }
                VersionCompatibility::Compatible => {}
            }
        }

        let violations = self.validate(code);
        if !violations.is_empty() {
            return ExecutionOutcome::failed(
                violations.join("; "),
                "validation",
                elapsed_ms(started),
            );
        }

        // Validation already proved the source parses.
        let program = match parser::parse(code) {
            Ok(program) => program,
            Err(e) => {
                return ExecutionOutcome::failed(
                    format!("syntax error: {}", e),
                    "validation",
                    elapsed_ms(started),
                )
            }
        };

        let api = BrowserApi::new(
            principal.to_string(),
            Arc::clone(&self.caps),
            Arc::clone(&self.objects),
            Arc::clone(&self.audit),
            Arc::clone(&self.transactions),
            Arc::clone(&*self.approval.read()),
        );

        let deadline = started + self.timeout;
        let result = Interpreter::new(&api, deadline, self.timeout.as_secs_f64()).run(&program);

        // Dropping the API drops any transaction guard the workflow left
        // open, which aborts those transactions.
        drop(api);

        let duration_ms = elapsed_ms(started);
        match result {
            Ok(WfValue::None) => ExecutionOutcome::completed(None, duration_ms),
            Ok(value) => ExecutionOutcome::completed(Some(to_json(&value)), duration_ms),
            Err(KernelError::Timeout(secs)) => {
                info!(target: "aegis", principal, "workflow timed out after {:.1}s", secs);
                ExecutionOutcome::timeout(
                    format!("execution timed out after {:.1}s", secs),
                    duration_ms,
                )
            }
            Err(e) => ExecutionOutcome::failed(e.to_string(), e.kind(), duration_ms),
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
