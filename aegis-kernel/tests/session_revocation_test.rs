mod common;

use aegis_kernel::KernelError;
use aegis_types::structs::{CapabilityRisk, GrantScope, SessionType};
use common::{open_kernel, open_kernel_at};
use std::error::Error;
use tempfile::TempDir;

/// A token revoked in one process lifetime must be denied in every later
/// one, even after an equivalent capability is re-granted.
#[test]
fn revocation_survives_restart_without_zombie_caps() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("db");

    let dead_token = {
        let kernel = open_kernel_at(&path);
        let capability =
            kernel
                .caps
                .grant("agent:a", "form.submit", "form:1", CapabilityRisk::Irreversible, None, None)?;
        assert!(kernel.caps.check("agent:a", "form.submit", "form:1")?);
        assert!(kernel.caps.revoke(&capability.token)?);
        capability.token
    };

    // New process over the same store.
    let kernel = open_kernel_at(&path);
    assert!(kernel.sessions.is_token_revoked(&dead_token));

    // A fresh grant for the same (principal, op, resource) works, on a new
    // token; the old token stays dead.
    let fresh =
        kernel
            .caps
            .grant("agent:a", "form.submit", "form:1", CapabilityRisk::Irreversible, None, None)?;
    assert_ne!(fresh.token, dead_token);
    assert!(kernel.caps.check("agent:a", "form.submit", "form:1")?);

    let revocations = kernel.sessions.list_revocations(None, None);
    let dead_records: Vec<_> = revocations
        .iter()
        .filter(|r| r.token == dead_token)
        .collect();
    assert_eq!(dead_records.len(), 1);
    Ok(())
}

#[test]
fn ledger_revocation_denies_with_revoked_reason() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    let capability =
        kernel
            .caps
            .grant("agent:a", "tab.*", "*", CapabilityRisk::Read, None, None)?;

    let grant = kernel
        .sessions
        .get_grant_by_token(&capability.token)
        .unwrap();
    kernel
        .sessions
        .revoke_grant(&grant.id, "user", "operator intervention")?;

    match kernel.caps.require("agent:a", "tab.read", "tab:1") {
        Err(KernelError::CapabilityDenied { reason, .. }) => assert_eq!(reason, "revoked"),
        other => panic!("expected revoked denial, got {:?}", other.err()),
    }
    Ok(())
}

#[test]
fn end_session_revokes_session_grants() -> Result<(), Box<dyn Error>> {
    let (kernel, _dir) = open_kernel();
    let session =
        kernel
            .sessions
            .create_session("agent:a", SessionType::Workspace, Some("workspace:1".into()), None, None)?;

    let bound = kernel.caps.grant_scoped(
        "agent:a",
        "tab.*",
        "*",
        CapabilityRisk::Read,
        None,
        None,
        GrantScope::Session,
        Some(session.id.clone()),
        "user",
    )?;
    let unbound =
        kernel
            .caps
            .grant("agent:b", "tab.*", "*", CapabilityRisk::Read, None, None)?;

    assert!(kernel.sessions.end_session(&session.id)?);

    assert!(kernel.sessions.is_token_revoked(&bound.token));
    assert!(!kernel.sessions.is_token_revoked(&unbound.token));
    assert!(!kernel.caps.check("agent:a", "tab.read", "tab:1")?);
    assert!(kernel.caps.check("agent:b", "tab.read", "tab:1")?);

    let revocations = kernel.sessions.list_revocations(Some("agent:a"), None);
    assert_eq!(revocations.len(), 1);
    assert_eq!(revocations[0].revoked_by, "session_end");
    Ok(())
}

#[test]
fn always_scope_grants_are_visible_after_restart() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("db");

    let token = {
        let kernel = open_kernel_at(&path);
        kernel
            .caps
            .grant_scoped(
                "user:bob",
                "workspace.*",
                "*",
                CapabilityRisk::Stateful,
                None,
                None,
                GrantScope::Always,
                None,
                "user",
            )?
            .token
    };

    let kernel = open_kernel_at(&path);
    let grant = kernel
        .sessions
        .get_grant_by_token(&token)
        .expect("persisted grant");
    assert_eq!(grant.scope, GrantScope::Always);
    assert!(grant.is_active());
    Ok(())
}

#[test]
fn batch_revocation_is_persisted_per_token() -> Result<(), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("db");

    let tokens: Vec<String> = {
        let kernel = open_kernel_at(&path);
        let tokens = (0..3)
            .map(|i| {
                kernel
                    .caps
                    .grant(
                        "agent:a",
                        &format!("tab.op{}", i),
                        "*",
                        CapabilityRisk::Read,
                        None,
                        None,
                    )
                    .map(|c| c.token)
            })
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(kernel.sessions.revoke_all_for_principal("agent:a", "user")?, 3);
        tokens
    };

    let kernel = open_kernel_at(&path);
    for token in &tokens {
        assert!(kernel.sessions.is_token_revoked(token));
    }
    assert_eq!(kernel.sessions.list_revocations(Some("agent:a"), None).len(), 3);
    Ok(())
}
