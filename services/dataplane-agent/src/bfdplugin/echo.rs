//! BFD echo function.

use std::sync::Arc;

use async_trait::async_trait;
use dpsync_reconcile::{
    Applied, Configurator, Handle, KeyedConfigurator, NameToIndex, ReconcileError,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::resolve_interface;
use crate::dataplane::Dataplane;
use crate::ifplugin::InterfaceConfigurator;
use crate::model::{unnamed, BfdEchoFunction};

pub const REGISTRY_TITLE: &str = "bfd_echo_function";

/// Configurator for the echo function.
///
/// The forwarder holds at most one echo source; configuring a second echo
/// function replaces the first.
pub struct BfdEchoConfigurator {
    dataplane: Arc<dyn Dataplane>,
    interfaces: Arc<InterfaceConfigurator>,
    registry: NameToIndex<BfdEchoFunction>,
    cache: Mutex<Option<(String, Handle)>>,
}

impl BfdEchoConfigurator {
    pub fn new(dataplane: Arc<dyn Dataplane>, interfaces: Arc<InterfaceConfigurator>) -> Self {
        Self {
            dataplane,
            interfaces,
            registry: NameToIndex::new(REGISTRY_TITLE),
            cache: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &NameToIndex<BfdEchoFunction> {
        &self.registry
    }
}

#[async_trait]
impl KeyedConfigurator for BfdEchoConfigurator {
    type Desired = BfdEchoFunction;

    async fn refresh(&self) -> Result<(), ReconcileError> {
        let source = self
            .dataplane
            .bfd_echo_source()
            .await
            .map_err(|e| e.into_reconcile("bfd echo source"))?;

        let cached = source.map(|handle| {
            let name = self
                .registry
                .lookup_by_handle(handle)
                .map(|(name, _)| name)
                .unwrap_or_else(|| unnamed("bfd-echo", handle));
            (name, handle)
        });

        for name in self.registry.names() {
            if cached.as_ref().map(|(n, _)| n) != Some(&name) {
                self.registry.unregister_name(&name);
            }
        }

        debug!(source = ?cached, "BFD echo function refreshed");
        *self.cache.lock() = cached;
        Ok(())
    }

    fn cached_names(&self) -> Vec<String> {
        self.cache.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    async fn create_or_update(&self, desired: &BfdEchoFunction) -> Result<Applied, ReconcileError> {
        desired.validate()?;
        let handle = resolve_interface(self.interfaces.registry(), &desired.echo_source_interface)?;

        let cached = self.cache.lock().clone();
        if cached.as_ref() == Some(&(desired.name.clone(), handle)) {
            debug!(name = %desired.name, "BFD echo function unchanged");
            return Ok(Applied::Unchanged);
        }
        let applied = if cached.is_some() {
            Applied::Updated
        } else {
            Applied::Created
        };

        self.dataplane
            .set_bfd_echo_source(handle)
            .await
            .map_err(|e| e.into_reconcile(&desired.name))?;

        if let Some((previous, _)) = cached.filter(|(name, _)| *name != desired.name) {
            warn!(previous = %previous, name = %desired.name, "BFD echo function replaced");
            self.registry.unregister_name(&previous);
        }
        self.registry
            .register_name(&desired.name, handle, desired.clone());
        *self.cache.lock() = Some((desired.name.clone(), handle));
        info!(
            name = %desired.name,
            source = %desired.echo_source_interface,
            "BFD echo function configured"
        );
        Ok(applied)
    }

    async fn remove(&self, name: &str) -> Result<(), ReconcileError> {
        let cached = self.cache.lock().clone();
        if cached.as_ref().map(|(n, _)| n.as_str()) != Some(name) {
            return Err(ReconcileError::NotFound(format!("bfd echo function {name}")));
        }

        self.dataplane
            .delete_bfd_echo_source()
            .await
            .map_err(|e| e.into_reconcile(name))?;
        self.registry.unregister_name(name);
        *self.cache.lock() = None;
        info!(name = %name, "BFD echo function deleted");
        Ok(())
    }
}
