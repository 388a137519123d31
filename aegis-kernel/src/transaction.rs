//! Transaction coordinator - checkpoints, commit, and rollback over the
//! object graph.
//!
//! The coordinator reverses only what graph snapshots capture: object `data`.
//! External side effects (a submitted form, a sent message) are outside its
//! guarantees and stay done; callers gate those behind IRREVERSIBLE
//! capabilities and human approval instead.

use crate::audit::AuditLog;
use crate::error::{KernelError, KernelResult};
use crate::object::{GraphSnapshot, ObjectManager};
use aegis_types::structs::{epoch_now, Provenance, TransactionState};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const INITIAL_CHECKPOINT: &str = "__initial__";

/// A saved graph snapshot within a transaction.
#[derive(Clone)]
pub struct Checkpoint {
    pub id: String,
    pub name: String,
    pub tx_id: String,
    pub timestamp: f64,
    pub state: GraphSnapshot,
}

/// A transaction with checkpoints and commit/rollback semantics.
pub struct Transaction {
    pub id: String,
    pub state: TransactionState,
    /// Checkpoints in creation order. Re-using a name overwrites in place.
    pub checkpoints: Vec<Checkpoint>,
    pub started_at: f64,
    pub ended_at: Option<f64>,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    fn checkpoint_named(&self, name: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.name == name)
    }
}

struct CoordinatorInner {
    transactions: HashMap<String, Transaction>,
    active: Option<String>,
    checkpoint_counter: u64,
}

/// Coordinates transactions over the object graph.
///
/// Only one transaction may be active at a time; the object manager is the
/// lock domain, and interleaving two snapshot chains over it would make
/// rollback ill-defined.
pub struct TransactionCoordinator {
    objects: Arc<ObjectManager>,
    audit: Arc<AuditLog>,
    inner: Mutex<CoordinatorInner>,
}

impl TransactionCoordinator {
    pub fn new(objects: Arc<ObjectManager>, audit: Arc<AuditLog>) -> Self {
        Self {
            objects,
            audit,
            inner: Mutex::new(CoordinatorInner {
                transactions: HashMap::new(),
                active: None,
                checkpoint_counter: 0,
            }),
        }
    }

    /// Begin a new transaction, capturing the full graph as the implicit
    /// `__initial__` checkpoint and binding the audit context to it.
    ///
    /// The returned guard aborts the transaction on drop unless it was
    /// committed or aborted first, so every exit path ends the transaction.
    pub fn begin(self: &Arc<Self>) -> KernelResult<TransactionGuard> {
        let tx_id = format!("tx:{}", &Uuid::new_v4().simple().to_string()[..8]);
        {
            let mut inner = self.inner.lock();
            if let Some(active) = &inner.active {
                return Err(KernelError::TransactionActive(active.clone()));
            }

            let state = self.objects.snapshot_all();
            inner.checkpoint_counter += 1;
            let initial = Checkpoint {
                id: format!("cp:{}", inner.checkpoint_counter),
                name: INITIAL_CHECKPOINT.to_string(),
                tx_id: tx_id.clone(),
                timestamp: epoch_now(),
                state,
            };

            inner.transactions.insert(
                tx_id.clone(),
                Transaction {
                    id: tx_id.clone(),
                    state: TransactionState::Active,
                    checkpoints: vec![initial],
                    started_at: epoch_now(),
                    ended_at: None,
                },
            );
            inner.active = Some(tx_id.clone());
        }

        self.audit.set_transaction_context(Some(tx_id.clone()), None);
        self.audit.log(
            "transaction.begin",
            "system",
            &tx_id,
            Map::new(),
            "started",
            Provenance::System,
            None,
        )?;

        Ok(TransactionGuard {
            coordinator: Arc::clone(self),
            tx_id,
            finished: false,
        })
    }

    /// Create a named checkpoint of the current graph.
    ///
    /// Writing an existing name silently overwrites that checkpoint.
    pub fn checkpoint(&self, tx_id: &str, name: &str) -> KernelResult<Checkpoint> {
        let checkpoint = {
            let mut inner = self.inner.lock();
            let state = self.objects.snapshot_all();
            inner.checkpoint_counter += 1;
            let checkpoint = Checkpoint {
                id: format!("cp:{}", inner.checkpoint_counter),
                name: name.to_string(),
                tx_id: tx_id.to_string(),
                timestamp: epoch_now(),
                state,
            };
            let tx = Self::active_tx_mut(&mut inner.transactions, tx_id)?;
            match tx.checkpoints.iter_mut().find(|cp| cp.name == name) {
                Some(existing) => *existing = checkpoint.clone(),
                None => tx.checkpoints.push(checkpoint.clone()),
            }
            checkpoint
        };

        self.audit
            .set_transaction_context(Some(tx_id.to_string()), Some(checkpoint.id.clone()));
        let mut args = Map::new();
        args.insert("name".into(), Value::String(name.to_string()));
        args.insert(
            "checkpoint_id".into(),
            Value::String(checkpoint.id.clone()),
        );
        self.audit.log(
            "transaction.checkpoint",
            "system",
            tx_id,
            args,
            "created",
            Provenance::System,
            None,
        )?;
        Ok(checkpoint)
    }

    /// Restore the object graph from a named checkpoint. The transaction
    /// stays ACTIVE.
    pub fn rollback(&self, tx_id: &str, name: &str) -> KernelResult<()> {
        let state = {
            let mut inner = self.inner.lock();
            let tx = Self::active_tx_mut(&mut inner.transactions, tx_id)?;
            let checkpoint = tx
                .checkpoint_named(name)
                .ok_or_else(|| KernelError::CheckpointNotFound(name.to_string()))?;
            checkpoint.state.clone()
        };

        self.objects.restore_snapshot(&state);

        let mut args = Map::new();
        args.insert("to_checkpoint".into(), Value::String(name.to_string()));
        self.audit.log(
            "transaction.rollback",
            "system",
            tx_id,
            args,
            "restored",
            Provenance::System,
            None,
        )?;
        Ok(())
    }

    /// Commit the transaction, finalizing all changes and discarding the
    /// snapshot chain.
    pub fn commit(&self, tx_id: &str) -> KernelResult<()> {
        {
            let mut inner = self.inner.lock();
            let tx = Self::active_tx_mut(&mut inner.transactions, tx_id)?;
            tx.state = TransactionState::Committed;
            tx.ended_at = Some(epoch_now());
            tx.checkpoints.clear();
            if inner.active.as_deref() == Some(tx_id) {
                inner.active = None;
            }
        }

        self.audit.log(
            "transaction.commit",
            "system",
            tx_id,
            Map::new(),
            "committed",
            Provenance::System,
            None,
        )?;
        self.audit.clear_transaction_context();
        Ok(())
    }

    /// Abort the transaction, restoring the graph captured at begin.
    pub fn abort(&self, tx_id: &str) -> KernelResult<()> {
        let initial = {
            let mut inner = self.inner.lock();
            let tx = inner
                .transactions
                .get_mut(tx_id)
                .ok_or_else(|| KernelError::TransactionNotActive(tx_id.to_string()))?;
            let initial = if tx.is_active() {
                tx.checkpoint_named(INITIAL_CHECKPOINT).cloned()
            } else {
                None
            };
            tx.state = TransactionState::Aborted;
            tx.ended_at = Some(epoch_now());
            if inner.active.as_deref() == Some(tx_id) {
                inner.active = None;
            }
            initial
        };

        if let Some(checkpoint) = initial {
            self.objects.restore_snapshot(&checkpoint.state);
        }

        self.audit.log(
            "transaction.abort",
            "system",
            tx_id,
            Map::new(),
            "aborted",
            Provenance::System,
            None,
        )?;
        self.audit.clear_transaction_context();
        Ok(())
    }

    pub fn state_of(&self, tx_id: &str) -> Option<TransactionState> {
        self.inner
            .lock()
            .transactions
            .get(tx_id)
            .map(|tx| tx.state)
    }

    pub fn active_transaction(&self) -> Option<String> {
        self.inner.lock().active.clone()
    }

    /// Names of explicit checkpoints in a transaction, in creation order.
    pub fn list_checkpoints(&self, tx_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .transactions
            .get(tx_id)
            .map(|tx| {
                tx.checkpoints
                    .iter()
                    .filter(|cp| cp.name != INITIAL_CHECKPOINT)
                    .map(|cp| cp.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn active_tx_mut<'a>(
        transactions: &'a mut HashMap<String, Transaction>,
        tx_id: &str,
    ) -> KernelResult<&'a mut Transaction> {
        let tx = transactions
            .get_mut(tx_id)
            .ok_or_else(|| KernelError::TransactionNotActive(tx_id.to_string()))?;
        if !tx.is_active() {
            return Err(KernelError::TransactionNotActive(tx_id.to_string()));
        }
        Ok(tx)
    }
}

/// Scoped transaction handle.
///
/// Guarantees that on every exit path the transaction ends in COMMITTED or
/// ABORTED: dropping the guard without an explicit `commit` or `abort`
/// aborts, restoring the graph captured at begin. This covers early returns
/// and panics as well as plain falls-through.
pub struct TransactionGuard {
    coordinator: Arc<TransactionCoordinator>,
    tx_id: String,
    finished: bool,
}

impl TransactionGuard {
    pub fn id(&self) -> &str {
        &self.tx_id
    }

    pub fn checkpoint(&self, name: &str) -> KernelResult<Checkpoint> {
        self.coordinator.checkpoint(&self.tx_id, name)
    }

    /// Roll back to a named checkpoint (default: the state at begin).
    pub fn rollback(&self, name: &str) -> KernelResult<()> {
        self.coordinator.rollback(&self.tx_id, name)
    }

    pub fn rollback_to_start(&self) -> KernelResult<()> {
        self.rollback(INITIAL_CHECKPOINT)
    }

    pub fn commit(&mut self) -> KernelResult<()> {
        self.coordinator.commit(&self.tx_id)?;
        self.finished = true;
        Ok(())
    }

    pub fn abort(&mut self) -> KernelResult<()> {
        self.coordinator.abort(&self.tx_id)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.coordinator.abort(&self.tx_id) {
            warn!(target: "aegis", "abort on scope exit failed for {}: {}", self.tx_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KernelStore;
    use tempfile::TempDir;

    fn setup() -> (Arc<ObjectManager>, Arc<TransactionCoordinator>, Arc<AuditLog>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KernelStore::open(dir.path().join("db")).unwrap());
        let audit = Arc::new(AuditLog::open(store, Some("s".into())).unwrap());
        let objects = Arc::new(ObjectManager::new(Arc::clone(&audit)));
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&objects),
            Arc::clone(&audit),
        ));
        (objects, coordinator, audit, dir)
    }

    #[test]
    fn rollback_restores_named_checkpoint_and_stays_active() {
        let (objects, coordinator, _audit, _dir) = setup();
        let tab = objects.create_tab("https://u0/", "").unwrap();

        let mut tx = coordinator.begin().unwrap();
        tx.checkpoint("a").unwrap();
        objects.navigate(&tab.id, "https://u1/").unwrap();
        tx.checkpoint("b").unwrap();
        objects.navigate(&tab.id, "https://u2/").unwrap();

        tx.rollback("a").unwrap();

        assert_eq!(
            objects.get(&tab.id).unwrap().field_str("url"),
            Some("https://u0/")
        );
        assert_eq!(
            coordinator.state_of(tx.id()),
            Some(TransactionState::Active)
        );
        tx.commit().unwrap();
    }

    #[test]
    fn rollback_to_start_at_begin_is_a_noop() {
        let (objects, coordinator, _audit, _dir) = setup();
        let tab = objects.create_tab("https://u0/", "").unwrap();

        let mut tx = coordinator.begin().unwrap();
        tx.rollback_to_start().unwrap();
        assert_eq!(
            objects.get(&tab.id).unwrap().field_str("url"),
            Some("https://u0/")
        );
        tx.commit().unwrap();
    }

    #[test]
    fn duplicate_checkpoint_name_overwrites() {
        let (objects, coordinator, _audit, _dir) = setup();
        let tab = objects.create_tab("https://u0/", "").unwrap();

        let mut tx = coordinator.begin().unwrap();
        tx.checkpoint("work").unwrap();
        objects.navigate(&tab.id, "https://u1/").unwrap();
        tx.checkpoint("work").unwrap();
        objects.navigate(&tab.id, "https://u2/").unwrap();

        tx.rollback("work").unwrap();
        assert_eq!(
            objects.get(&tab.id).unwrap().field_str("url"),
            Some("https://u1/")
        );
        assert_eq!(coordinator.list_checkpoints(tx.id()), vec!["work"]);
        tx.commit().unwrap();
    }

    #[test]
    fn abort_restores_initial_graph() {
        let (objects, coordinator, _audit, _dir) = setup();
        let tab = objects.create_tab("https://u0/", "").unwrap();

        let mut tx = coordinator.begin().unwrap();
        objects.navigate(&tab.id, "https://u1/").unwrap();
        tx.abort().unwrap();

        assert_eq!(
            objects.get(&tab.id).unwrap().field_str("url"),
            Some("https://u0/")
        );
        assert_eq!(
            coordinator.state_of(tx.id()),
            Some(TransactionState::Aborted)
        );
    }

    #[test]
    fn drop_without_commit_aborts() {
        let (objects, coordinator, audit, _dir) = setup();
        let tab = objects.create_tab("https://u0/", "").unwrap();

        let tx_id = {
            let tx = coordinator.begin().unwrap();
            objects.navigate(&tab.id, "https://u1/").unwrap();
            tx.id().to_string()
            // guard dropped here without commit
        };

        assert_eq!(
            objects.get(&tab.id).unwrap().field_str("url"),
            Some("https://u0/")
        );
        assert_eq!(
            coordinator.state_of(&tx_id),
            Some(TransactionState::Aborted)
        );

        // transaction.begin and transaction.abort bracket the lifetime.
        let tx_entries = audit.transaction_log(&tx_id);
        assert_eq!(tx_entries.first().unwrap().op, "transaction.begin");
        assert_eq!(tx_entries.last().unwrap().op, "transaction.abort");
    }

    #[test]
    fn operations_on_finished_transaction_fail() {
        let (_objects, coordinator, _audit, _dir) = setup();
        let mut tx = coordinator.begin().unwrap();
        let tx_id = tx.id().to_string();
        tx.commit().unwrap();

        assert!(matches!(
            coordinator.checkpoint(&tx_id, "late"),
            Err(KernelError::TransactionNotActive(_))
        ));
        assert!(matches!(
            coordinator.rollback(&tx_id, INITIAL_CHECKPOINT),
            Err(KernelError::TransactionNotActive(_))
        ));
        assert!(matches!(
            coordinator.commit(&tx_id),
            Err(KernelError::TransactionNotActive(_))
        ));
    }

    #[test]
    fn unknown_checkpoint_is_an_error() {
        let (_objects, coordinator, _audit, _dir) = setup();
        let mut tx = coordinator.begin().unwrap();
        assert!(matches!(
            tx.rollback("nope"),
            Err(KernelError::CheckpointNotFound(_))
        ));
        tx.commit().unwrap();
    }

    #[test]
    fn only_one_transaction_at_a_time() {
        let (_objects, coordinator, _audit, _dir) = setup();
        let mut tx = coordinator.begin().unwrap();
        assert!(matches!(
            coordinator.begin(),
            Err(KernelError::TransactionActive(_))
        ));
        tx.commit().unwrap();
        let mut tx2 = coordinator.begin().unwrap();
        tx2.commit().unwrap();
    }

    #[test]
    fn audit_entries_carry_transaction_context() {
        let (objects, coordinator, audit, _dir) = setup();
        let tab = objects.create_tab("https://u0/", "").unwrap();

        let mut tx = coordinator.begin().unwrap();
        let tx_id = tx.id().to_string();
        objects.navigate(&tab.id, "https://u1/").unwrap();
        tx.checkpoint("mid").unwrap();
        tx.commit().unwrap();

        let entries = audit.transaction_log(&tx_id);
        assert!(entries.iter().any(|e| e.op == "transaction.begin"));
        assert!(entries.iter().any(|e| e.op == "transaction.checkpoint"));
        // Context is cleared after commit.
        let after = objects.create_tab("https://after/", "").unwrap();
        let _ = after;
        let later = audit.query(&crate::audit::AuditQuery::for_op("tab.create"));
        assert!(later.last().unwrap().tx_id.is_none());
    }
}
