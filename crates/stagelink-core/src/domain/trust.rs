//! Pinned trust records for paired masters and the store that owns them.
//!
//! A [`PairedMaster`] is created by the follower-side pairing handshake and
//! is the *only* durable trust state in the system.  Its `public_key_pem`
//! is write-once: every later signature check for that instance id must use
//! the key already on file, so an attacker who gains control of the network
//! path after pairing cannot swap in a different key (trust-on-first-use).
//!
//! The [`TrustStore`] trait is the single owner of these records.  It is
//! injected into both the pairing client (which creates records) and the
//! command channel client (which reads them every reconciliation tick), so
//! neither reaches into configuration state directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error type for trust store operations.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// The backing store failed to persist a mutation.
    #[error("failed to persist trust records: {0}")]
    Persist(String),
}

/// Durable trust record for one paired master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairedMaster {
    /// UUID the master advertises as its identity.
    pub instance_id: Uuid,
    /// Display name captured at pairing time.
    pub name: String,
    /// Pinned public key.  Immutable once stored; re-pairing the same
    /// instance id verifies against this key and updates only the hints.
    pub public_key_pem: String,
    /// Milliseconds since the Unix epoch when the handshake succeeded.
    pub paired_at: u64,
    /// Last host this master was reached at; a fallback when the in-memory
    /// contact cache is empty after a restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_hint: Option<String>,
    /// Pairing port that worked last time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_port_hint: Option<u16>,
    /// `true` when this master has declared that the URLs it sends are not
    /// reachable across the link as-is; every command URL is then rewritten
    /// toward the endpoint the follower actually used.
    #[serde(default)]
    pub nat_compatibility: bool,
}

/// Trait for reading and mutating the persisted set of paired masters.
///
/// Implementations must be `Send + Sync` so a single store can be shared
/// via `Arc<dyn TrustStore>` between the pairing client and the command
/// channel client.  Methods return owned records; callers never hold a
/// lock across their own work.
pub trait TrustStore: Send + Sync {
    /// Returns the record for `instance_id`, if one exists.
    fn get(&self, instance_id: Uuid) -> Option<PairedMaster>;

    /// Returns all records.  Order is unspecified.
    fn all(&self) -> Vec<PairedMaster>;

    /// Inserts `record`, replacing any existing record with the same
    /// `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError::Persist`] if the backing store cannot be
    /// written.
    fn upsert(&self, record: PairedMaster) -> Result<(), TrustStoreError>;

    /// Removes the record for `instance_id`.  Returns `true` if a record
    /// was present.  Removing an unknown id is a no-op, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError::Persist`] if the backing store cannot be
    /// written.
    fn remove(&self, instance_id: Uuid) -> Result<bool, TrustStoreError>;
}

/// In-memory trust store backed by `RwLock<Vec<PairedMaster>>`.
///
/// Suitable for tests and short-lived processes.  The node uses a
/// config-file-backed implementation of [`TrustStore`] instead.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    records: std::sync::RwLock<Vec<PairedMaster>>,
}

impl MemoryTrustStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn get(&self, instance_id: Uuid) -> Option<PairedMaster> {
        self.records
            .read()
            .unwrap()
            .iter()
            .find(|r| r.instance_id == instance_id)
            .cloned()
    }

    fn all(&self) -> Vec<PairedMaster> {
        self.records.read().unwrap().clone()
    }

    fn upsert(&self, record: PairedMaster) -> Result<(), TrustStoreError> {
        let mut records = self.records.write().unwrap();
        match records.iter_mut().find(|r| r.instance_id == record.instance_id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    fn remove(&self, instance_id: Uuid) -> Result<bool, TrustStoreError> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|r| r.instance_id != instance_id);
        Ok(records.len() != before)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
