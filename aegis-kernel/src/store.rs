//! Durable record store shared by the audit log and the session manager.
//!
//! One RocksDB database holds every persisted record, namespaced by a
//! `prefix::` on the key. Records are serialized as JSON because several of
//! them carry free-form `serde_json` values (audit args, grant metadata),
//! which a non-self-describing format cannot round-trip. At startup each
//! subsystem scans its prefix and mirrors the rows into memory; the database
//! is only read again on the next start.

use crate::error::{KernelError, KernelResult};
use rocksdb::{IteratorMode, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::warn;

pub const AUDIT_PREFIX: &str = "audit::";
pub const SESSION_PREFIX: &str = "session::";
pub const GRANT_PREFIX: &str = "grant::";
pub const REVOCATION_PREFIX: &str = "revocation::";

pub struct KernelStore {
    db: DB,
}

impl KernelStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> KernelResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| KernelError::Storage(format!("open {:?}: {}", path.as_ref(), e)))?;
        Ok(Self { db })
    }

    /// Write one record under `<prefix><id>`.
    pub fn put<T: Serialize>(&self, prefix: &str, id: &str, record: &T) -> KernelResult<()> {
        let body = serde_json::to_vec(record)
            .map_err(|e| KernelError::Storage(format!("encode {}{}: {}", prefix, id, e)))?;
        self.db.put(format!("{}{}", prefix, id).as_bytes(), body)?;
        Ok(())
    }

    /// Delete one record. Missing keys are not an error.
    pub fn delete(&self, prefix: &str, id: &str) -> KernelResult<()> {
        self.db.delete(format!("{}{}", prefix, id).as_bytes())?;
        Ok(())
    }

    /// Load every record under a prefix, in key order.
    ///
    /// Rows that fail to decode are skipped with a warning rather than
    /// poisoning startup; the store may have been written by a newer build.
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> KernelResult<Vec<(String, T)>> {
        let mut records = Vec::new();
        for row in self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        )) {
            let (key_bytes, value_bytes) = row?;
            let key = match std::str::from_utf8(&key_bytes) {
                Ok(k) => k,
                Err(_) => continue,
            };
            if !key.starts_with(prefix) {
                break;
            }
            match serde_json::from_slice::<T>(&value_bytes) {
                Ok(record) => records.push((key[prefix.len()..].to_string(), record)),
                Err(e) => {
                    warn!(target: "aegis", "skipping undecodable row {}: {}", key, e);
                }
            }
        }
        Ok(records)
    }
}
