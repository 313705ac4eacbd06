//! Resync orchestrators.
//!
//! [`Resync`] converges one handle-addressed resource kind:
//!
//! ```text
//! Step 0  dump live state            (pass-fatal on error)
//! Step 1  correlate names to handles (first pass: persisted snapshot)
//! Step 2  delete obsolete live objects
//! Step 3  modify correlated objects
//! Step 4  create missing objects
//! Step 5  prune bindings to vanished handles
//! ```
//!
//! Steps 2-4 continue past per-object failures; the pass reports the last one.
//! [`KeyedResync`] is the simpler variant for caller-named kinds.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::configurator::{Applied, Configurator, KeyedConfigurator, ModifyError, Named};
use crate::error::{ErrorAggregator, ReconcileError};
use crate::persist::SnapshotStore;
use crate::registry::NameToIndex;

/// Counters for one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub retained: usize,
    pub deleted: usize,
    pub modified: usize,
    pub created: usize,
    pub failed: usize,
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "retained={} deleted={} modified={} created={} failed={}",
            self.retained, self.deleted, self.modified, self.created, self.failed
        )
    }
}

/// Storage key for the snapshot of one registry of one agent.
pub fn snapshot_key(label: &str, registry_title: &str) -> String {
    format!("{label}/{registry_title}")
}

#[derive(Debug, Default)]
struct PassState {
    first_pass_done: bool,
    passes: u64,
}

/// Resync orchestrator for one handle-addressed resource kind.
///
/// Passes are serialized; the first pass of the instance correlates against
/// the snapshot left by the previous process.
pub struct Resync<C: Configurator> {
    configurator: Arc<C>,
    store: Arc<dyn SnapshotStore>,
    snapshot_key: String,
    state: Mutex<PassState>,
}

impl<C> Resync<C>
where
    C: Configurator,
    C::Desired: Serialize + DeserializeOwned,
{
    /// Create an orchestrator persisting under `label`.
    pub fn new(configurator: Arc<C>, store: Arc<dyn SnapshotStore>, label: &str) -> Self {
        let snapshot_key = snapshot_key(label, configurator.registry().title());
        Self {
            configurator,
            store,
            snapshot_key,
            state: Mutex::new(PassState::default()),
        }
    }

    pub fn configurator(&self) -> &Arc<C> {
        &self.configurator
    }

    /// Key the correlation snapshot is stored under.
    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// Whether the restart correlation has already happened.
    pub async fn first_pass_done(&self) -> bool {
        self.state.lock().await.first_pass_done
    }

    /// Number of passes that got past the live dump.
    pub async fn passes(&self) -> u64 {
        self.state.lock().await.passes
    }

    /// Run one pass converging the forwarder to `desired`.
    pub async fn run(&self, desired: &[C::Desired]) -> Result<PassSummary, ReconcileError> {
        let mut state = self.state.lock().await;
        let registry = self.configurator.registry();

        debug!(
            registry = %registry.title(),
            desired = desired.len(),
            first_pass_done = state.first_pass_done,
            "Resync begin"
        );

        // Step 0
        let live = self.configurator.lookup_live_state().await?;
        state.passes += 1;
        debug!(registry = %registry.title(), live = live.len(), "Live state dumped");

        // Step 1
        let correlation: NameToIndex<C::Desired> =
            NameToIndex::new(format!("{} resync corr", registry.title()));
        let seed = if state.first_pass_done {
            None
        } else {
            // The previous snapshot must be read before it is overwritten.
            let previous = self.load_previous()?;
            let current = registry.to_snapshot(&self.snapshot_key)?;
            self.store.save(&self.snapshot_key, &current)?;
            state.first_pass_done = true;
            Some(previous)
        };
        let source = seed.as_ref().unwrap_or(registry);
        for d in desired {
            if let Some((handle, metadata)) = source.lookup_by_name(d.name()) {
                debug!(name = %d.name(), handle = %handle, "Correlated");
                correlation.register_name(d.name(), handle, metadata);
            }
        }

        let mut errors = ErrorAggregator::new();
        let mut summary = PassSummary::default();
        let mut bound: HashSet<String> = HashSet::new();
        let before = registry.entries();

        // Step 2
        for (handle, obj) in &live {
            let correlated = correlation.lookup_by_handle(*handle).is_some();
            if let Some((internal_name, descriptor)) = self.configurator.retained(*handle, obj) {
                if !correlated {
                    registry.register_name(&internal_name, *handle, descriptor);
                    bound.insert(internal_name);
                }
                summary.retained += 1;
                continue;
            }
            if correlated {
                continue;
            }

            let result = self.configurator.delete(obj, *handle).await;
            match result {
                Ok(()) => {
                    info!(registry = %registry.title(), handle = %handle, "Deleted obsolete object");
                    summary.deleted += 1;
                }
                Err(e) => {
                    warn!(
                        registry = %registry.title(),
                        handle = %handle,
                        error = %e,
                        "Failed to delete obsolete object"
                    );
                    errors.push(e);
                }
            }
        }

        // Step 3
        let mut to_create = Vec::new();
        for d in desired {
            let correlated = correlation
                .lookup_by_name(d.name())
                .and_then(|(handle, _)| live.get(&handle).map(|obj| (handle, obj)));
            let Some((handle, obj)) = correlated else {
                to_create.push(d);
                continue;
            };

            let live_kind = self.configurator.live_kind(obj);
            let bound_handle = match self.configurator.modify(d, handle, live_kind, obj).await {
                Ok(new_handle) => {
                    summary.modified += 1;
                    Some(new_handle)
                }
                Err(ModifyError { error, handle: left_at }) => {
                    warn!(
                        name = %d.name(),
                        handle = %handle,
                        kind = ?live_kind,
                        error = %error,
                        "Failed to modify object"
                    );
                    errors.push(error);
                    left_at
                }
            };
            // Registered even after a failed modify, as long as the object
            // still exists.
            let Some(bound_handle) = bound_handle else {
                continue;
            };
            if !self.configurator.is_pending(d) {
                registry.register_name(d.name(), bound_handle, d.clone());
                bound.insert(d.name().to_string());
            }
        }

        // Step 4
        for d in to_create {
            match self.configurator.create(d).await {
                Ok(()) => {
                    summary.created += 1;
                    bound.insert(d.name().to_string());
                }
                Err(e) => {
                    warn!(name = %d.name(), error = %e, "Failed to create object");
                    errors.push(e);
                }
            }
        }

        self.configurator.retain_pending(desired);

        // Step 5: only bindings that predate the pass and were not rebound.
        for entry in before {
            if live.contains_key(&entry.handle) || bound.contains(&entry.name) {
                continue;
            }
            let unchanged = registry
                .lookup_by_name(&entry.name)
                .is_some_and(|(handle, _)| handle == entry.handle);
            if unchanged {
                warn!(
                    name = %entry.name,
                    handle = %entry.handle,
                    "Dropping binding to vanished object"
                );
                registry.unregister_name(&entry.name);
            }
        }

        summary.failed = errors.failures();
        debug!(registry = %registry.title(), %summary, "Resync end");

        errors.finish().map(|()| summary)
    }

    fn load_previous(&self) -> Result<NameToIndex<C::Desired>, ReconcileError> {
        let title = format!("{} persisted", self.configurator.registry().title());
        match self.store.load(&self.snapshot_key)? {
            Some(snapshot) => {
                debug!(
                    key = %self.snapshot_key,
                    entries = snapshot.entries.len(),
                    saved_at = %snapshot.saved_at,
                    "Loaded correlation snapshot"
                );
                NameToIndex::from_snapshot(title, &snapshot)
            }
            None => Ok(NameToIndex::new(title)),
        }
    }
}

/// Resync orchestrator for caller-named kinds.
///
/// No correlation is needed: the desired name is the identity.
pub struct KeyedResync<C: KeyedConfigurator> {
    configurator: Arc<C>,
    lock: Mutex<()>,
}

impl<C: KeyedConfigurator> KeyedResync<C> {
    pub fn new(configurator: Arc<C>) -> Self {
        Self {
            configurator,
            lock: Mutex::new(()),
        }
    }

    pub fn configurator(&self) -> &Arc<C> {
        &self.configurator
    }

    /// Run one pass converging the forwarder to `desired`.
    pub async fn run(&self, desired: &[C::Desired]) -> Result<PassSummary, ReconcileError> {
        let _guard = self.lock.lock().await;
        debug!(desired = desired.len(), "Keyed resync begin");

        self.configurator.refresh().await?;

        let mut errors = ErrorAggregator::new();
        let mut summary = PassSummary::default();

        for d in desired {
            match self.configurator.create_or_update(d).await {
                Ok(Applied::Created) => summary.created += 1,
                Ok(Applied::Updated) => summary.modified += 1,
                Ok(Applied::Unchanged) => {}
                Err(e) => {
                    warn!(name = %d.name(), error = %e, "Failed to apply object");
                    errors.push(e);
                }
            }
        }

        let wanted: HashSet<&str> = desired.iter().map(Named::name).collect();
        for name in self.configurator.cached_names() {
            if wanted.contains(name.as_str()) {
                continue;
            }
            if errors.record(&name, self.configurator.remove(&name).await) {
                info!(name = %name, "Removed obsolete object");
                summary.deleted += 1;
            }
        }

        summary.failed = errors.failures();
        debug!(%summary, "Keyed resync end");

        errors.finish().map(|()| summary)
    }
}
