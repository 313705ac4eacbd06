//! Correlation snapshot persistence.
//!
//! A snapshot is a serialized copy of an identity registry, stored under the
//! owning agent's label. It is only read back at the first resync pass after a
//! restart, to recover name/handle bindings the forwarder kept alive.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::registry::Handle;

/// One persisted binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub handle: Handle,
    pub metadata: serde_json::Value,
}

/// A persisted registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Owning agent label (and registry namespace).
    pub label: String,

    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,

    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Create a snapshot stamped with the current time.
    pub fn new(label: impl Into<String>, entries: Vec<SnapshotEntry>) -> Self {
        Self {
            label: label.into(),
            saved_at: Utc::now(),
            entries,
        }
    }

    /// An empty snapshot for `label`.
    pub fn empty(label: impl Into<String>) -> Self {
        Self::new(label, Vec::new())
    }
}

/// Durable storage for correlation snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Store `snapshot` under `label`, replacing any previous one.
    fn save(&self, label: &str, snapshot: &Snapshot) -> Result<(), ReconcileError>;

    /// Read the snapshot last saved under `label`.
    fn load(&self, label: &str) -> Result<Option<Snapshot>, ReconcileError>;
}

/// Process-local snapshot store.
///
/// Survives orchestrator instances but not the process; useful for tests and
/// for agents running without a data directory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored labels.
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, label: &str, snapshot: &Snapshot) -> Result<(), ReconcileError> {
        self.snapshots
            .lock()
            .insert(label.to_string(), snapshot.clone());
        Ok(())
    }

    fn load(&self, label: &str) -> Result<Option<Snapshot>, ReconcileError> {
        Ok(self.snapshots.lock().get(label).cloned())
    }
}
