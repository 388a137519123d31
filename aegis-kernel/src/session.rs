//! Session and revocation management.
//!
//! Sessions give capability grants a bounded lifetime (process, workspace,
//! timed, persistent). The grant ledger tracks every issued capability from
//! grant to revocation; the revocation ledger is the authoritative deny list
//! and is persisted unconditionally, so a token revoked in one process
//! lifetime stays dead in every later one.

use crate::error::KernelResult;
use crate::store::{KernelStore, GRANT_PREFIX, REVOCATION_PREFIX, SESSION_PREFIX};
use aegis_types::structs::{
    epoch_now, CapabilityGrant, GrantScope, RevocationRecord, Session, SessionType,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use uuid::Uuid;

/// Constant-time equality for capability tokens.
pub fn token_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

struct SessionInner {
    sessions: HashMap<String, Session>,
    grants: HashMap<String, CapabilityGrant>,
    revocations: HashMap<String, RevocationRecord>,
    /// Mirror of the revocation ledger keyed by token for O(1) checks.
    revoked_tokens: HashSet<String>,
}

/// Manages capability sessions and revocation persistence.
///
/// All ledger state sits behind one `RwLock`: a revocation's write-lock
/// release happens-before any later check's read-lock acquire, which is the
/// ordering the capability broker relies on. The end-of-session cascade runs
/// under the same write lock, so concurrent checks observe either none or all
/// of its revocations.
pub struct SessionManager {
    store: Arc<KernelStore>,
    inner: RwLock<SessionInner>,
}

impl SessionManager {
    /// Open the manager, loading persisted sessions, grants and the full
    /// revocation ledger from the store.
    pub fn open(store: Arc<KernelStore>) -> KernelResult<Self> {
        let sessions: HashMap<String, Session> = store
            .scan_prefix::<Session>(SESSION_PREFIX)?
            .into_iter()
            .map(|(_, s)| (s.id.clone(), s))
            .collect();
        let grants: HashMap<String, CapabilityGrant> = store
            .scan_prefix::<CapabilityGrant>(GRANT_PREFIX)?
            .into_iter()
            .map(|(_, g)| (g.id.clone(), g))
            .collect();
        let revocations: HashMap<String, RevocationRecord> = store
            .scan_prefix::<RevocationRecord>(REVOCATION_PREFIX)?
            .into_iter()
            .map(|(_, r)| (r.id.clone(), r))
            .collect();
        let revoked_tokens = revocations.values().map(|r| r.token.clone()).collect();

        info!(
            target: "aegis",
            "session manager loaded: {} sessions, {} grants, {} revocations",
            sessions.len(),
            grants.len(),
            revocations.len()
        );

        Ok(Self {
            store,
            inner: RwLock::new(SessionInner {
                sessions,
                grants,
                revocations,
                revoked_tokens,
            }),
        })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn create_session(
        &self,
        principal: &str,
        session_type: SessionType,
        workspace_id: Option<String>,
        ttl_seconds: Option<f64>,
        metadata: Option<Map<String, Value>>,
    ) -> KernelResult<Session> {
        let session = Session {
            id: format!("session:{}", &Uuid::new_v4().simple().to_string()[..8]),
            session_type,
            principal: principal.to_string(),
            created_at: epoch_now(),
            expires_at: ttl_seconds.map(|ttl| epoch_now() + ttl),
            workspace_id,
            metadata: metadata.unwrap_or_default(),
        };

        if session_type == SessionType::Persistent {
            self.store.put(SESSION_PREFIX, &session.id, &session)?;
        }
        self.inner
            .write()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// End a session and revoke every grant bound to it.
    ///
    /// The cascade runs under the write lock, so it is atomic with respect
    /// to concurrent capability checks.
    pub fn end_session(&self, session_id: &str) -> KernelResult<bool> {
        let mut inner = self.inner.write();
        if inner.sessions.remove(session_id).is_none() {
            return Ok(false);
        }

        let bound: Vec<String> = inner
            .grants
            .values()
            .filter(|g| g.session_id.as_deref() == Some(session_id) && g.is_active())
            .map(|g| g.id.clone())
            .collect();
        for grant_id in bound {
            self.revoke_grant_locked(&mut inner, &grant_id, "session_end", "session ended")?;
        }

        self.store.delete(SESSION_PREFIX, session_id)?;
        debug!(target: "aegis", "session {} ended", session_id);
        Ok(true)
    }

    /// Get a session by id. Expired sessions are ended on access.
    pub fn get_session(&self, session_id: &str) -> KernelResult<Option<Session>> {
        let expired = {
            let inner = self.inner.read();
            match inner.sessions.get(session_id) {
                Some(session) if session.is_expired() => true,
                Some(session) => return Ok(Some(session.clone())),
                None => return Ok(None),
            }
        };
        if expired {
            self.end_session(session_id)?;
        }
        Ok(None)
    }

    // =========================================================================
    // Grants
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn record_grant(
        &self,
        token: &str,
        principal: &str,
        operation: &str,
        resource: &str,
        scope: GrantScope,
        granted_by: &str,
        session_id: Option<String>,
        expires_at: Option<f64>,
        metadata: Option<Map<String, Value>>,
    ) -> KernelResult<CapabilityGrant> {
        let grant = CapabilityGrant {
            id: format!("grant:{}", &Uuid::new_v4().simple().to_string()[..8]),
            token: token.to_string(),
            principal: principal.to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            scope,
            session_id,
            granted_at: epoch_now(),
            granted_by: granted_by.to_string(),
            expires_at,
            revoked_at: None,
            revoked_by: None,
            metadata: metadata.unwrap_or_default(),
        };

        // Only permanent grants survive a restart; everything else is
        // re-granted per session.
        if scope == GrantScope::Always {
            self.store.put(GRANT_PREFIX, &grant.id, &grant)?;
        }
        self.inner
            .write()
            .grants
            .insert(grant.id.clone(), grant.clone());
        Ok(grant)
    }

    /// Revoke a grant. Returns false when the grant is unknown or already
    /// inactive; a second revocation of the same grant never produces a
    /// second ledger record.
    pub fn revoke_grant(
        &self,
        grant_id: &str,
        revoked_by: &str,
        reason: &str,
    ) -> KernelResult<bool> {
        let mut inner = self.inner.write();
        self.revoke_grant_locked(&mut inner, grant_id, revoked_by, reason)
    }

    fn revoke_grant_locked(
        &self,
        inner: &mut SessionInner,
        grant_id: &str,
        revoked_by: &str,
        reason: &str,
    ) -> KernelResult<bool> {
        let grant = match inner.grants.get_mut(grant_id) {
            Some(grant) if grant.is_active() => grant,
            _ => return Ok(false),
        };
        grant.revoked_at = Some(epoch_now());
        grant.revoked_by = Some(revoked_by.to_string());

        let revocation = RevocationRecord {
            id: format!("revoke:{}", &Uuid::new_v4().simple().to_string()[..8]),
            grant_id: grant_id.to_string(),
            token: grant.token.clone(),
            principal: grant.principal.clone(),
            operation: grant.operation.clone(),
            resource: grant.resource.clone(),
            revoked_at: grant.revoked_at.unwrap(),
            revoked_by: revoked_by.to_string(),
            reason: reason.to_string(),
        };

        // The revocation is persisted unconditionally, even for transient
        // grants; this is what keeps tokens dead across restarts.
        self.store.put(REVOCATION_PREFIX, &revocation.id, &revocation)?;
        if grant.scope == GrantScope::Always {
            let grant = grant.clone();
            self.store.put(GRANT_PREFIX, &grant.id, &grant)?;
        }

        inner.revoked_tokens.insert(revocation.token.clone());
        inner
            .revocations
            .insert(revocation.id.clone(), revocation);
        Ok(true)
    }

    /// O(1) membership test against the loaded revocation ledger.
    pub fn is_token_revoked(&self, token: &str) -> bool {
        self.inner.read().revoked_tokens.contains(token)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn list_grants(
        &self,
        principal: Option<&str>,
        active_only: bool,
        since: Option<f64>,
    ) -> Vec<CapabilityGrant> {
        let inner = self.inner.read();
        let mut grants: Vec<CapabilityGrant> = inner
            .grants
            .values()
            .filter(|g| principal.map_or(true, |p| g.principal == p))
            .filter(|g| !active_only || g.is_active())
            .filter(|g| since.map_or(true, |s| g.granted_at >= s))
            .cloned()
            .collect();
        grants.sort_by(|a, b| {
            b.granted_at
                .partial_cmp(&a.granted_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        grants
    }

    pub fn list_revocations(
        &self,
        principal: Option<&str>,
        since: Option<f64>,
    ) -> Vec<RevocationRecord> {
        let inner = self.inner.read();
        let mut revocations: Vec<RevocationRecord> = inner
            .revocations
            .values()
            .filter(|r| principal.map_or(true, |p| r.principal == p))
            .filter(|r| since.map_or(true, |s| r.revoked_at >= s))
            .cloned()
            .collect();
        revocations.sort_by(|a, b| {
            b.revoked_at
                .partial_cmp(&a.revoked_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        revocations
    }

    /// Find a grant by its capability token. Token comparison is
    /// constant-time; this sits on the revoke path.
    pub fn get_grant_by_token(&self, token: &str) -> Option<CapabilityGrant> {
        let inner = self.inner.read();
        inner
            .grants
            .values()
            .find(|g| token_eq(&g.token, token))
            .cloned()
    }

    /// Revoke every active grant for a principal. Each grant gets its own
    /// persisted revocation record.
    pub fn revoke_all_for_principal(
        &self,
        principal: &str,
        revoked_by: &str,
    ) -> KernelResult<usize> {
        let mut inner = self.inner.write();
        let targets: Vec<String> = inner
            .grants
            .values()
            .filter(|g| g.principal == principal && g.is_active())
            .map(|g| g.id.clone())
            .collect();
        let mut count = 0;
        for grant_id in targets {
            if self.revoke_grant_locked(&mut inner, &grant_id, revoked_by, "")? {
                count += 1;
            }
        }
        Ok(count)
    }
}
