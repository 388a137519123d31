//! Capability broker - authorization and token lifecycle.
//!
//! Every privileged operation requires an unforgeable capability token that
//! binds a principal to an operation pattern and a resource pattern. The
//! broker validates every check against its in-memory table and the session
//! manager's revocation ledger; a token that has ever been revoked is denied
//! forever, no matter what is granted afterwards.

use crate::audit::AuditLog;
use crate::error::{KernelError, KernelResult};
use crate::session::{token_eq, SessionManager};
use aegis_types::structs::{
    epoch_now, Capability, CapabilityRisk, GrantScope, Provenance,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::RwLock;
use rand::RngCore;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const REASON_NO_MATCH: &str = "no matching capability";
const REASON_REVOKED: &str = "revoked";

/// Validates every privileged operation and manages capability lifecycle.
pub struct CapabilityBroker {
    capabilities: RwLock<HashMap<String, Vec<Capability>>>,
    audit: Arc<AuditLog>,
    sessions: Arc<SessionManager>,
}

impl CapabilityBroker {
    pub fn new(audit: Arc<AuditLog>, sessions: Arc<SessionManager>) -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            audit,
            sessions,
        }
    }

    /// Generate an unforgeable token: 256 bits from the OS RNG, URL-safe
    /// base64 without padding.
    fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Grant a capability with the default session scope.
    pub fn grant(
        &self,
        principal: &str,
        operation: &str,
        resource: &str,
        risk: CapabilityRisk,
        constraints: Option<Map<String, Value>>,
        ttl_seconds: Option<f64>,
    ) -> KernelResult<Capability> {
        self.grant_scoped(
            principal,
            operation,
            resource,
            risk,
            constraints,
            ttl_seconds,
            GrantScope::Session,
            None,
            "system",
        )
    }

    /// Grant a capability, recording it in the session manager's grant
    /// ledger under an explicit scope. Every broker token has a ledger
    /// entry, which is what makes its later revocation durable.
    #[allow(clippy::too_many_arguments)]
    pub fn grant_scoped(
        &self,
        principal: &str,
        operation: &str,
        resource: &str,
        risk: CapabilityRisk,
        constraints: Option<Map<String, Value>>,
        ttl_seconds: Option<f64>,
        scope: GrantScope,
        session_id: Option<String>,
        granted_by: &str,
    ) -> KernelResult<Capability> {
        let token = Self::generate_token();
        let expires_at = ttl_seconds.map(|ttl| epoch_now() + ttl);

        let capability = Capability {
            token: token.clone(),
            principal: principal.to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            risk,
            constraints: constraints.unwrap_or_default(),
            granted_at: epoch_now(),
            expires_at,
        };

        self.sessions.record_grant(
            &token,
            principal,
            operation,
            resource,
            scope,
            granted_by,
            session_id,
            expires_at,
            None,
        )?;

        self.capabilities
            .write()
            .entry(principal.to_string())
            .or_default()
            .push(capability.clone());

        let mut args = Map::new();
        args.insert("to".into(), Value::String(principal.to_string()));
        args.insert("operation".into(), Value::String(operation.to_string()));
        args.insert("resource".into(), Value::String(resource.to_string()));
        self.audit.log(
            "capability.grant",
            "system",
            &format!("cap:{}", &token[..8]),
            args,
            "granted",
            Provenance::System,
            None,
        )?;

        debug!(target: "aegis", "granted {} on {} to {}", operation, resource, principal);
        Ok(capability)
    }

    /// Check whether a principal may perform an operation on a resource.
    ///
    /// Emits exactly one `capability.check` audit entry per call, success or
    /// failure. A capability whose token appears in the revocation ledger
    /// never satisfies the check.
    pub fn check(&self, principal: &str, operation: &str, resource: &str) -> KernelResult<bool> {
        let (allowed, _reason) = self.evaluate(principal, operation, resource);

        let mut args = Map::new();
        args.insert("operation".into(), Value::String(operation.to_string()));
        self.audit.log(
            "capability.check",
            principal,
            resource,
            args,
            if allowed { "allowed" } else { "denied" },
            Provenance::System,
            None,
        )?;
        Ok(allowed)
    }

    /// Check and raise [`KernelError::CapabilityDenied`] on failure.
    ///
    /// A denial caused by revocation carries `reason = "revoked"`.
    pub fn require(&self, principal: &str, operation: &str, resource: &str) -> KernelResult<()> {
        let (allowed, reason) = self.evaluate(principal, operation, resource);

        let mut args = Map::new();
        args.insert("operation".into(), Value::String(operation.to_string()));
        self.audit.log(
            "capability.check",
            principal,
            resource,
            args,
            if allowed { "allowed" } else { "denied" },
            Provenance::System,
            None,
        )?;

        if allowed {
            Ok(())
        } else {
            Err(KernelError::denied(principal, operation, resource, reason))
        }
    }

    /// The check itself, without the audit entry: non-blocking in steady
    /// state, a pure lookup over the in-memory table and the loaded
    /// revocation set.
    fn evaluate(&self, principal: &str, operation: &str, resource: &str) -> (bool, &'static str) {
        let capabilities = self.capabilities.read();
        let mut saw_revoked = false;
        if let Some(caps) = capabilities.get(principal) {
            for cap in caps {
                if cap.is_expired() || !cap.matches(operation, resource) {
                    continue;
                }
                if self.sessions.is_token_revoked(&cap.token) {
                    saw_revoked = true;
                    continue;
                }
                return (true, "");
            }
        }
        if saw_revoked {
            (false, REASON_REVOKED)
        } else {
            (false, REASON_NO_MATCH)
        }
    }

    /// Revoke a capability by token. The in-memory capability is removed and
    /// a revocation is recorded through the session manager, which persists
    /// it. Returns false when the token is unknown (second revocations are
    /// no-ops).
    pub fn revoke(&self, token: &str) -> KernelResult<bool> {
        let removed = {
            let mut capabilities = self.capabilities.write();
            let mut found: Option<Capability> = None;
            for caps in capabilities.values_mut() {
                if let Some(pos) = caps.iter().position(|c| token_eq(&c.token, token)) {
                    found = Some(caps.remove(pos));
                    break;
                }
            }
            found
        };

        let capability = match removed {
            Some(capability) => capability,
            None => return Ok(false),
        };

        if let Some(grant) = self.sessions.get_grant_by_token(token) {
            self.sessions.revoke_grant(&grant.id, "system", "broker revoke")?;
        }

        let mut args = Map::new();
        args.insert("was_for".into(), Value::String(capability.principal.clone()));
        self.audit.log(
            "capability.revoke",
            "system",
            &format!("cap:{}", &token[..8.min(token.len())]),
            args,
            "revoked",
            Provenance::System,
            None,
        )?;
        Ok(true)
    }

    /// Revoke every capability held by a principal. Returns the count.
    pub fn revoke_all(&self, principal: &str) -> KernelResult<usize> {
        let caps = self
            .capabilities
            .write()
            .remove(principal)
            .unwrap_or_default();
        let count = caps.len();

        for cap in &caps {
            if let Some(grant) = self.sessions.get_grant_by_token(&cap.token) {
                self.sessions
                    .revoke_grant(&grant.id, "system", "broker revoke_all")?;
            }
        }

        if count > 0 {
            self.audit.log(
                "capability.revoke_all",
                "system",
                principal,
                Map::new(),
                &format!("revoked:{}", count),
                Provenance::System,
                None,
            )?;
        }
        Ok(count)
    }

    /// List the usable (non-expired, non-revoked) capabilities of a
    /// principal.
    pub fn list_capabilities(&self, principal: &str) -> Vec<Capability> {
        self.capabilities
            .read()
            .get(principal)
            .map(|caps| {
                caps.iter()
                    .filter(|c| !c.is_expired() && !self.sessions.is_token_revoked(&c.token))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
