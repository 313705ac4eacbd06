//! Single-hop BFD sessions.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dpsync_reconcile::{Applied, Configurator, KeyedConfigurator, NameToIndex, ReconcileError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::resolve_interface;
use crate::dataplane::{BfdSessionDetails, Dataplane, DataplaneError};
use crate::ifplugin::InterfaceConfigurator;
use crate::model::{unnamed, BfdSession};

pub const REGISTRY_TITLE: &str = "bfd_sessions";

/// Configurator for BFD sessions.
///
/// Sessions are bound to the software interface index they run on.
pub struct BfdSessionConfigurator {
    dataplane: Arc<dyn Dataplane>,
    interfaces: Arc<InterfaceConfigurator>,
    registry: NameToIndex<BfdSession>,
    /// Sessions programmed in the forwarder, by interface name.
    cache: Mutex<BTreeMap<String, BfdSessionDetails>>,
}

impl BfdSessionConfigurator {
    pub fn new(dataplane: Arc<dyn Dataplane>, interfaces: Arc<InterfaceConfigurator>) -> Self {
        Self {
            dataplane,
            interfaces,
            registry: NameToIndex::new(REGISTRY_TITLE),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &NameToIndex<BfdSession> {
        &self.registry
    }
}

#[async_trait]
impl KeyedConfigurator for BfdSessionConfigurator {
    type Desired = BfdSession;

    async fn refresh(&self) -> Result<(), ReconcileError> {
        let sessions = self
            .dataplane
            .dump_bfd_sessions()
            .await
            .map_err(|e| e.into_reconcile("bfd session dump"))?;

        let interfaces = self.interfaces.registry();
        let mut cache = BTreeMap::new();
        for details in sessions {
            // Sessions on unnamed interfaces are keyed by index so they can
            // still be removed.
            let name = interfaces
                .lookup_by_handle(details.sw_if_index)
                .map(|(name, _)| name)
                .unwrap_or_else(|| unnamed("bfd-session", details.sw_if_index));
            self.registry
                .register_name(&name, details.sw_if_index, details.to_session(&name));
            cache.insert(name, details);
        }

        let found: HashSet<&String> = cache.keys().collect();
        for name in self.registry.names() {
            if !found.contains(&name) {
                warn!(name = %name, "BFD session vanished from dataplane");
                self.registry.unregister_name(&name);
            }
        }

        debug!(sessions = cache.len(), "BFD sessions refreshed");
        *self.cache.lock() = cache;
        Ok(())
    }

    fn cached_names(&self) -> Vec<String> {
        self.cache.lock().keys().cloned().collect()
    }

    async fn create_or_update(&self, desired: &BfdSession) -> Result<Applied, ReconcileError> {
        desired.validate()?;
        let sw_if_index = resolve_interface(self.interfaces.registry(), &desired.interface)?;
        let details = BfdSessionDetails::from_session(sw_if_index, desired);
        let name = desired.interface.as_str();
        let err = |e: DataplaneError| e.into_reconcile(name);

        let existing = self.cache.lock().get(name).cloned();
        let applied = match existing {
            Some(existing) if existing == details => {
                debug!(name = %name, "BFD session unchanged");
                Applied::Unchanged
            }
            Some(existing)
                if existing.sw_if_index == sw_if_index
                    && existing.source_address == details.source_address
                    && existing.destination_address == details.destination_address =>
            {
                self.dataplane
                    .modify_bfd_session(&details)
                    .await
                    .map_err(err)?;
                info!(name = %name, sw_if_index = %sw_if_index, "BFD session modified");
                Applied::Updated
            }
            Some(existing) => {
                self.dataplane
                    .delete_bfd_session(existing.sw_if_index)
                    .await
                    .map_err(err)?;
                self.cache.lock().remove(name);
                self.registry.unregister_name(name);

                self.dataplane.add_bfd_session(&details).await.map_err(err)?;
                info!(name = %name, sw_if_index = %sw_if_index, "BFD session re-created");
                Applied::Updated
            }
            None => {
                self.dataplane.add_bfd_session(&details).await.map_err(err)?;
                info!(name = %name, sw_if_index = %sw_if_index, "BFD session created");
                Applied::Created
            }
        };

        self.registry
            .register_name(name, sw_if_index, desired.clone());
        self.cache.lock().insert(name.to_string(), details);
        Ok(applied)
    }

    async fn remove(&self, name: &str) -> Result<(), ReconcileError> {
        let details = self
            .cache
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ReconcileError::NotFound(format!("bfd session {name}")))?;

        self.dataplane
            .delete_bfd_session(details.sw_if_index)
            .await
            .map_err(|e| e.into_reconcile(name))?;
        self.registry.unregister_name(name);
        self.cache.lock().remove(name);
        info!(name = %name, sw_if_index = %details.sw_if_index, "BFD session deleted");
        Ok(())
    }
}
