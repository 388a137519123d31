//! Client for the kernel's local IPC protocol.

use aegis_types::structs::{
    AuditEntry, Capability, CapabilityRisk, ExecutionOutcome, GrantScope,
};
use aegis_types::wire::{read_frame, write_frame};
use aegis_types::{KernelRequest, KernelResponse};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kernel error: {0}")]
    Kernel(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Connection-per-call client for the kernel socket.
pub struct KernelClient {
    addr: SocketAddr,
}

impl KernelClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn call(&self, request: KernelRequest) -> ClientResult<KernelResponse> {
        let mut stream = TcpStream::connect(self.addr).await?;
        write_frame(&mut stream, &request).await?;
        let response = read_frame(&mut stream).await?;
        match response {
            KernelResponse::Error(message) => Err(ClientError::Kernel(message)),
            other => Ok(other),
        }
    }

    pub async fn execute(&self, code: &str, principal: &str) -> ClientResult<ExecutionOutcome> {
        match self
            .call(KernelRequest::Execute {
                code: code.to_string(),
                principal: principal.to_string(),
            })
            .await?
        {
            KernelResponse::Execution(outcome) => Ok(outcome),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    pub async fn validate(&self, code: &str) -> ClientResult<(bool, Vec<String>)> {
        match self
            .call(KernelRequest::Validate {
                code: code.to_string(),
            })
            .await?
        {
            KernelResponse::Validation { valid, errors } => Ok((valid, errors)),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    pub async fn grant(
        &self,
        principal: &str,
        operation: &str,
        resource: &str,
        risk: CapabilityRisk,
        ttl_seconds: Option<f64>,
        scope: Option<GrantScope>,
    ) -> ClientResult<Capability> {
        match self
            .call(KernelRequest::Grant {
                principal: principal.to_string(),
                operation: operation.to_string(),
                resource: resource.to_string(),
                risk,
                ttl_seconds,
                scope,
            })
            .await?
        {
            KernelResponse::Granted(capability) => Ok(capability),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    pub async fn revoke(&self, token: &str) -> ClientResult<bool> {
        match self
            .call(KernelRequest::Revoke {
                token: token.to_string(),
            })
            .await?
        {
            KernelResponse::Revoked(revoked) => Ok(revoked),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }

    pub async fn query_audit(
        &self,
        principal: Option<String>,
        op: Option<String>,
        limit: Option<usize>,
    ) -> ClientResult<Vec<AuditEntry>> {
        match self
            .call(KernelRequest::QueryAudit {
                principal,
                op,
                tx_id: None,
                limit,
            })
            .await?
        {
            KernelResponse::AuditEntries(entries) => Ok(entries),
            other => Err(ClientError::Protocol(format!("{:?}", other))),
        }
    }
}
