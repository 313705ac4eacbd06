//! Background registry persistence.
//!
//! Re-saves a registry snapshot whenever the registry changes, so the next
//! agent process finds bindings to correlate against.

use std::sync::Arc;

use dpsync_reconcile::{NameToIndex, SnapshotStore};
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Saves snapshots of one registry under a fixed key.
pub struct RegistryPersister {
    store: Arc<dyn SnapshotStore>,
    key: String,
}

impl RegistryPersister {
    pub fn new(store: Arc<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Save the current contents of `registry`.
    pub fn persist<M: Clone + Serialize>(&self, registry: &NameToIndex<M>) -> bool {
        let result = registry
            .to_snapshot(&self.key)
            .and_then(|snapshot| self.store.save(&self.key, &snapshot));
        match result {
            Ok(()) => {
                debug!(key = %self.key, entries = registry.len(), "Registry persisted");
                true
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to persist registry");
                false
            }
        }
    }

    /// Persist `registry` after every burst of changes until shutdown.
    pub async fn run<M: Clone + Serialize>(
        &self,
        registry: &NameToIndex<M>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(key = %self.key, "Starting registry persister");
        let mut events = registry.watch();

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            // Coalesce whatever else is already queued.
                            loop {
                                match events.try_recv() {
                                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                                    Err(_) => break,
                                }
                            }
                            self.persist(registry);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.persist(registry);
                        info!(key = %self.key, "Registry persister shutting down");
                        break;
                    }
                }
            }
        }
    }
}
