//! Name-to-handle identity registry.
//!
//! Dataplane objects are addressed by handles the forwarder assigns, while
//! desired state names them. [`NameToIndex`] keeps the two keys in a single
//! bijection and carries the last-known descriptor of every object as
//! metadata.
//!
//! # Invariants
//!
//! - A name maps to at most one handle and a handle to at most one name
//! - Both indices are updated under one lock, so readers never observe a
//!   half-applied mutation

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ReconcileError;
use crate::persist::{Snapshot, SnapshotEntry};

/// Capacity of the change notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Forwarder-assigned object handle.
///
/// Only stable within one forwarder process lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    /// Handle of the default resource the forwarder always creates.
    pub const RESERVED: Handle = Handle(0);

    /// Returns true for the reserved default resource.
    pub fn is_reserved(&self) -> bool {
        *self == Self::RESERVED
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Handle {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// One registry binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<M> {
    pub name: String,
    pub handle: Handle,
    pub metadata: M,
}

/// Change notification emitted after every registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { name: String, handle: Handle },
    Unregistered { name: String, handle: Handle },
}

/// Derives secondary index keys `(field, value)` from metadata.
pub type Indexer<M> = Arc<dyn Fn(&M) -> Vec<(String, String)> + Send + Sync>;

struct Inner<M> {
    by_name: HashMap<String, (Handle, M)>,
    by_handle: HashMap<Handle, String>,
    by_field: HashMap<(String, String), BTreeSet<String>>,
}

impl<M> Inner<M> {
    fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_handle: HashMap::new(),
            by_field: HashMap::new(),
        }
    }

    fn remove_name(&mut self, name: &str, indexer: Option<&Indexer<M>>) -> Option<Handle> {
        let (handle, metadata) = self.by_name.remove(name)?;
        self.by_handle.remove(&handle);
        if let Some(indexer) = indexer {
            for key in indexer(&metadata) {
                if let Some(names) = self.by_field.get_mut(&key) {
                    names.remove(name);
                    if names.is_empty() {
                        self.by_field.remove(&key);
                    }
                }
            }
        }
        Some(handle)
    }
}

/// Bidirectional name/handle registry with attached metadata.
pub struct NameToIndex<M> {
    title: String,
    inner: RwLock<Inner<M>>,
    indexer: Option<Indexer<M>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<M> fmt::Debug for NameToIndex<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameToIndex")
            .field("title", &self.title)
            .field("len", &self.inner.read().by_name.len())
            .finish()
    }
}

impl<M: Clone> NameToIndex<M> {
    /// Create an empty registry.
    pub fn new(title: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            title: title.into(),
            inner: RwLock::new(Inner::new()),
            indexer: None,
            events,
        }
    }

    /// Create an empty registry with a secondary index over metadata.
    pub fn with_indexer<F>(title: impl Into<String>, indexer: F) -> Self
    where
        F: Fn(&M) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        let mut registry = Self::new(title);
        registry.indexer = Some(Arc::new(indexer));
        registry
    }

    /// Registry title (used in logs and as a persistence namespace suffix).
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Bind `name` to `handle`, replacing any entry holding either key.
    pub fn register_name(&self, name: &str, handle: Handle, metadata: M) {
        let mut events = Vec::with_capacity(2);
        {
            let mut inner = self.inner.write();
            let indexer = self.indexer.as_ref();

            let previous_owner = inner.by_handle.get(&handle).cloned();
            if let Some(previous_owner) = previous_owner {
                if previous_owner != name {
                    inner.remove_name(&previous_owner, indexer);
                    events.push(RegistryEvent::Unregistered {
                        name: previous_owner,
                        handle,
                    });
                }
            }
            inner.remove_name(name, indexer);

            if let Some(indexer) = indexer {
                for key in indexer(&metadata) {
                    inner
                        .by_field
                        .entry(key)
                        .or_default()
                        .insert(name.to_string());
                }
            }
            inner.by_handle.insert(handle, name.to_string());
            inner.by_name.insert(name.to_string(), (handle, metadata));
        }

        events.push(RegistryEvent::Registered {
            name: name.to_string(),
            handle,
        });
        self.notify(events);
    }

    /// Remove the entry for `name`, returning its handle.
    pub fn unregister_name(&self, name: &str) -> Option<Handle> {
        let handle = self.inner.write().remove_name(name, self.indexer.as_ref())?;
        self.notify(vec![RegistryEvent::Unregistered {
            name: name.to_string(),
            handle,
        }]);
        Some(handle)
    }

    /// Remove the entry for `handle`, returning its name.
    pub fn unregister_handle(&self, handle: Handle) -> Option<String> {
        let name = {
            let mut inner = self.inner.write();
            let name = inner.by_handle.get(&handle).cloned()?;
            inner.remove_name(&name, self.indexer.as_ref());
            name
        };
        self.notify(vec![RegistryEvent::Unregistered {
            name: name.clone(),
            handle,
        }]);
        Some(name)
    }

    /// Look up the handle and metadata bound to `name`.
    pub fn lookup_by_name(&self, name: &str) -> Option<(Handle, M)> {
        self.inner.read().by_name.get(name).cloned()
    }

    /// Look up the name and metadata bound to `handle`.
    pub fn lookup_by_handle(&self, handle: Handle) -> Option<(String, M)> {
        let inner = self.inner.read();
        let name = inner.by_handle.get(&handle)?;
        let (_, metadata) = inner.by_name.get(name)?;
        Some((name.clone(), metadata.clone()))
    }

    /// Names whose metadata indexes `field` as `value`.
    pub fn lookup_names_by_field(&self, field: &str, value: &str) -> Vec<String> {
        self.inner
            .read()
            .by_field
            .get(&(field.to_string(), value.to_string()))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all current entries, in no particular order.
    pub fn entries(&self) -> Vec<Entry<M>> {
        self.inner
            .read()
            .by_name
            .iter()
            .map(|(name, (handle, metadata))| Entry {
                name: name.clone(),
                handle: *handle,
                metadata: metadata.clone(),
            })
            .collect()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to change notifications.
    pub fn watch(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, events: Vec<RegistryEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

impl<M: Clone + Serialize> NameToIndex<M> {
    /// Serialize the current entries into a snapshot for `label`.
    pub fn to_snapshot(&self, label: &str) -> Result<Snapshot, ReconcileError> {
        let mut entries = self
            .entries()
            .into_iter()
            .map(|entry| {
                let metadata = serde_json::to_value(&entry.metadata).map_err(|e| {
                    ReconcileError::Persistence(format!(
                        "failed to encode metadata of {}: {e}",
                        entry.name
                    ))
                })?;
                Ok(SnapshotEntry {
                    name: entry.name,
                    handle: entry.handle,
                    metadata,
                })
            })
            .collect::<Result<Vec<_>, ReconcileError>>()?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Snapshot::new(label, entries))
    }
}

impl<M: Clone + DeserializeOwned> NameToIndex<M> {
    /// Build a registry seeded from a persisted snapshot.
    pub fn from_snapshot(
        title: impl Into<String>,
        snapshot: &Snapshot,
    ) -> Result<Self, ReconcileError> {
        let registry = Self::new(title);
        for entry in &snapshot.entries {
            let metadata: M = serde_json::from_value(entry.metadata.clone()).map_err(|e| {
                ReconcileError::Persistence(format!(
                    "failed to decode metadata of {}: {e}",
                    entry.name
                ))
            })?;
            registry.register_name(&entry.name, entry.handle, metadata);
        }
        Ok(registry)
    }
}
