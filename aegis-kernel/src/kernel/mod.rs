//! Kernel wiring.
//!
//! `Kernel` owns the subsystems and is the single entry point collaborators
//! talk to: the IPC server hands it decoded requests, integration surfaces
//! reach the subsystems through its public fields.

use crate::audit::{AuditLog, AuditQuery};
use crate::capability::CapabilityBroker;
use crate::error::KernelResult;
use crate::object::ObjectManager;
use crate::runtime::{ApprovalProvider, WorkflowRuntime, DEFAULT_TIMEOUT_SECS};
use crate::session::SessionManager;
use crate::store::KernelStore;
use crate::transaction::TransactionCoordinator;
use aegis_types::structs::GrantScope;
use aegis_types::{KernelRequest, KernelResponse};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Kernel construction options.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Path of the record store (RocksDB directory).
    pub db_path: PathBuf,
    /// Salt for PII field-name hashing; random when absent.
    pub workspace_salt: Option<String>,
    /// Wall-clock budget for a single workflow execution.
    pub timeout_secs: f64,
}

impl KernelConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            workspace_salt: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// The assembled kernel.
pub struct Kernel {
    pub store: Arc<KernelStore>,
    pub audit: Arc<AuditLog>,
    pub sessions: Arc<SessionManager>,
    pub caps: Arc<CapabilityBroker>,
    pub objects: Arc<ObjectManager>,
    pub transactions: Arc<TransactionCoordinator>,
    pub runtime: WorkflowRuntime,
}

impl Kernel {
    /// Open the store and wire every subsystem.
    pub fn open(config: KernelConfig) -> KernelResult<Self> {
        let store = Arc::new(KernelStore::open(&config.db_path)?);
        let audit = Arc::new(AuditLog::open(
            Arc::clone(&store),
            config.workspace_salt.clone(),
        )?);
        let sessions = Arc::new(SessionManager::open(Arc::clone(&store))?);
        let caps = Arc::new(CapabilityBroker::new(
            Arc::clone(&audit),
            Arc::clone(&sessions),
        ));
        let objects = Arc::new(ObjectManager::new(Arc::clone(&audit)));
        let transactions = Arc::new(TransactionCoordinator::new(
            Arc::clone(&objects),
            Arc::clone(&audit),
        ));
        let runtime = WorkflowRuntime::new(
            Arc::clone(&caps),
            Arc::clone(&objects),
            Arc::clone(&audit),
            Arc::clone(&transactions),
            config.timeout_secs,
        );

        info!(target: "aegis", "kernel ready, store at {:?}", config.db_path);
        Ok(Self {
            store,
            audit,
            sessions,
            caps,
            objects,
            transactions,
            runtime,
        })
    }

    pub fn set_approval_provider(&self, provider: ApprovalProvider) {
        self.runtime.set_approval_provider(provider);
    }

    /// Process one protocol request. Failures become `Error` responses;
    /// this function never panics the connection handler.
    pub fn process_request(&self, request: KernelRequest) -> KernelResponse {
        match request {
            KernelRequest::Execute { code, principal } => {
                KernelResponse::Execution(self.runtime.execute(&code, &principal))
            }
            KernelRequest::Validate { code } => {
                let errors = self.runtime.validate(&code);
                KernelResponse::Validation {
                    valid: errors.is_empty(),
                    errors,
                }
            }
            KernelRequest::Grant {
                principal,
                operation,
                resource,
                risk,
                ttl_seconds,
                scope,
            } => {
                let result = self.caps.grant_scoped(
                    &principal,
                    &operation,
                    &resource,
                    risk,
                    None,
                    ttl_seconds,
                    scope.unwrap_or(GrantScope::Session),
                    None,
                    "user",
                );
                match result {
                    Ok(capability) => KernelResponse::Granted(capability),
                    Err(e) => KernelResponse::Error(e.to_string()),
                }
            }
            KernelRequest::Revoke { token } => match self.caps.revoke(&token) {
                Ok(revoked) => KernelResponse::Revoked(revoked),
                Err(e) => KernelResponse::Error(e.to_string()),
            },
            KernelRequest::ListCapabilities { principal } => {
                KernelResponse::Capabilities(self.caps.list_capabilities(&principal))
            }
            KernelRequest::QueryAudit {
                principal,
                op,
                tx_id,
                limit,
            } => {
                let query = AuditQuery {
                    principal,
                    op,
                    tx_id,
                    limit,
                    ..Default::default()
                };
                KernelResponse::AuditEntries(self.audit.query(&query))
            }
            KernelRequest::ListObjects { object_type } => {
                let objects = match object_type {
                    Some(object_type) => self.objects.list_by_type(object_type),
                    None => self.objects.list_all(),
                };
                KernelResponse::Objects(objects)
            }
        }
    }
}
