//! BFD authentication keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dpsync_reconcile::{Applied, Handle, KeyedConfigurator, NameToIndex, ReconcileError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dataplane::{BfdKeyDetails, Dataplane};
use crate::model::{unnamed, BfdAuthKey};

pub const REGISTRY_TITLE: &str = "bfd_auth_keys";

/// Configurator for BFD authentication keys.
///
/// The forwarder addresses keys by id, which is used as the registry handle.
/// Secrets are never dumped back, so an unchanged registered key is not
/// re-sent.
pub struct BfdAuthKeyConfigurator {
    dataplane: Arc<dyn Dataplane>,
    registry: NameToIndex<BfdAuthKey>,
    cache: Mutex<BTreeMap<String, BfdKeyDetails>>,
}

impl BfdAuthKeyConfigurator {
    pub fn new(dataplane: Arc<dyn Dataplane>) -> Self {
        Self {
            dataplane,
            registry: NameToIndex::new(REGISTRY_TITLE),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &NameToIndex<BfdAuthKey> {
        &self.registry
    }

    /// Move a cached key holding `desired.id` under another name to
    /// `desired.name`, so it is updated rather than removed as obsolete.
    fn adopt(&self, desired: &BfdAuthKey) {
        let mut cache = self.cache.lock();
        let other = cache
            .iter()
            .find(|(name, details)| details.id == desired.id && **name != desired.name)
            .map(|(name, _)| name.clone());
        let Some(other) = other else {
            return;
        };
        if cache.contains_key(&desired.name) {
            warn!(name = %desired.name, other = %other, id = desired.id, "BFD key id already cached under another name");
            return;
        }
        if let Some(details) = cache.remove(&other) {
            debug!(name = %desired.name, previous = %other, id = desired.id, "Adopting cached BFD key");
            self.registry.unregister_name(&other);
            cache.insert(desired.name.clone(), details);
        }
    }
}

#[async_trait]
impl KeyedConfigurator for BfdAuthKeyConfigurator {
    type Desired = BfdAuthKey;

    async fn refresh(&self) -> Result<(), ReconcileError> {
        let keys = self
            .dataplane
            .dump_bfd_keys()
            .await
            .map_err(|e| e.into_reconcile("bfd key dump"))?;

        let mut cache = BTreeMap::new();
        for details in keys {
            let name = self
                .registry
                .lookup_by_handle(Handle(details.id))
                .map(|(name, _)| name)
                .unwrap_or_else(|| unnamed("bfd-key", details.id));
            cache.insert(name, details);
        }

        for entry in self.registry.entries() {
            if !cache.contains_key(&entry.name) {
                self.registry.unregister_name(&entry.name);
            }
        }

        debug!(keys = cache.len(), "BFD keys refreshed");
        *self.cache.lock() = cache;
        Ok(())
    }

    fn cached_names(&self) -> Vec<String> {
        self.cache.lock().keys().cloned().collect()
    }

    async fn create_or_update(&self, desired: &BfdAuthKey) -> Result<Applied, ReconcileError> {
        desired.validate()?;
        self.adopt(desired);

        let registered = self.registry.lookup_by_name(&desired.name);
        let cached = self.cache.lock().get(&desired.name).copied();
        if cached.is_some() && registered.as_ref().map(|(_, key)| key) == Some(desired) {
            debug!(name = %desired.name, id = desired.id, "BFD key unchanged");
            return Ok(Applied::Unchanged);
        }

        // A renumbered key is removed under its old id first.
        if let Some(old) = cached.filter(|old| old.id != desired.id) {
            self.dataplane
                .delete_bfd_key(old.id)
                .await
                .map_err(|e| e.into_reconcile(&desired.name))?;
            self.registry.unregister_name(&desired.name);
            self.cache.lock().remove(&desired.name);
        }

        self.dataplane
            .set_bfd_key(desired)
            .await
            .map_err(|e| e.into_reconcile(&desired.name))?;
        info!(name = %desired.name, id = desired.id, "BFD key configured");

        self.registry
            .register_name(&desired.name, Handle(desired.id), desired.clone());
        self.cache.lock().insert(
            desired.name.clone(),
            BfdKeyDetails {
                id: desired.id,
                authentication_type: desired.authentication_type,
            },
        );
        Ok(if cached.is_some() {
            Applied::Updated
        } else {
            Applied::Created
        })
    }

    async fn remove(&self, name: &str) -> Result<(), ReconcileError> {
        let details = self
            .cache
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| ReconcileError::NotFound(format!("bfd key {name}")))?;

        self.dataplane
            .delete_bfd_key(details.id)
            .await
            .map_err(|e| e.into_reconcile(name))?;
        self.registry.unregister_name(name);
        self.cache.lock().remove(name);
        info!(name = %name, id = details.id, "BFD key deleted");
        Ok(())
    }
}
