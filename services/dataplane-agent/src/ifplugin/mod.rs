//! Interface configurator.
//!
//! Programs interfaces through the [`Dataplane`] API and keeps the
//! `sw_if_indexes` registry of name to software interface index bindings.

mod afpacket;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dpsync_reconcile::{
    Configurator, ErrorAggregator, Handle, ModifyError, NameToIndex, ReconcileError,
};
use tracing::{debug, info, warn};

use crate::dataplane::{Dataplane, DataplaneError, InterfaceDetails};
use crate::model::{Interface, InterfaceType, IpPrefix};

pub use afpacket::AfPacketTracker;

/// Title of the interface registry.
pub const REGISTRY_TITLE: &str = "sw_if_indexes";

/// Secondary index field holding the interface type.
pub const TYPE_INDEX: &str = "type";

/// Configurator for network interfaces.
pub struct InterfaceConfigurator {
    dataplane: Arc<dyn Dataplane>,
    registry: NameToIndex<Interface>,
    afpacket: AfPacketTracker,
}

impl InterfaceConfigurator {
    pub fn new(dataplane: Arc<dyn Dataplane>) -> Self {
        let registry = NameToIndex::with_indexer(REGISTRY_TITLE, |iface: &Interface| {
            vec![(TYPE_INDEX.to_string(), iface.kind.as_str().to_string())]
        });
        Self {
            dataplane,
            registry,
            afpacket: AfPacketTracker::new(),
        }
    }

    /// Registered interface names of the given type.
    pub fn interfaces_by_type(&self, kind: InterfaceType) -> Vec<String> {
        self.registry.lookup_names_by_field(TYPE_INDEX, kind.as_str())
    }

    /// AF_PACKET interfaces waiting for their host link.
    pub fn pending_afpacket(&self) -> Vec<String> {
        self.afpacket.pending_names()
    }

    /// Compare the forwarder's host links with the last known listing and
    /// replay the AF_PACKET transitions in between.
    pub async fn sync_host_links(&self) -> Result<(), ReconcileError> {
        let links = self
            .dataplane
            .host_links()
            .await
            .map_err(|e| e.into_reconcile("host links"))?;
        let (added, removed) = self.afpacket.diff_host_links(&links);

        let mut errors = ErrorAggregator::new();
        for host in removed {
            if let Err(e) = self.host_link_removed(&host).await {
                errors.push(e);
            }
        }
        for host in added {
            if let Err(e) = self.host_link_added(&host).await {
                errors.push(e);
            }
        }
        errors.finish()
    }

    /// Create the AF_PACKET interfaces that were waiting for `host`.
    pub async fn host_link_added(&self, host: &str) -> Result<(), ReconcileError> {
        let mut errors = ErrorAggregator::new();
        for iface in self.afpacket.link_added(host) {
            info!(name = %iface.name, host = %host, "Host link appeared, creating AF_PACKET interface");
            errors.record(&iface.name, self.program(&iface).await);
        }
        errors.finish()
    }

    /// Tear down the AF_PACKET interfaces bound to `host` and park them.
    pub async fn host_link_removed(&self, host: &str) -> Result<(), ReconcileError> {
        self.afpacket.link_removed(host);

        let mut errors = ErrorAggregator::new();
        for name in self.interfaces_by_type(InterfaceType::AfPacket) {
            let Some((handle, iface)) = self.registry.lookup_by_name(&name) else {
                continue;
            };
            if iface.afpacket.as_ref().map(|l| l.host_if_name.as_str()) != Some(host) {
                continue;
            }

            let result = self
                .dataplane
                .delete_interface(handle)
                .await
                .map_err(|e| e.into_reconcile(&name));
            if errors.record(&name, result) {
                self.registry.unregister_name(&name);
                info!(name = %name, host = %host, "Host link removed, AF_PACKET interface pending");
                self.afpacket.park(iface);
            }
        }
        errors.finish()
    }

    /// Create the interface object and set its attributes.
    ///
    /// The binding is registered as soon as the object exists, even if an
    /// attribute is then rejected.
    async fn program(&self, desired: &Interface) -> Result<Handle, ReconcileError> {
        let handle = self
            .dataplane
            .create_interface(desired)
            .await
            .map_err(|e| e.into_reconcile(&desired.name))?;
        info!(
            name = %desired.name,
            handle = %handle,
            kind = %desired.kind,
            "Interface created"
        );

        self.registry
            .register_name(&desired.name, handle, desired.clone());
        self.apply_attributes(desired, handle, None).await?;
        Ok(handle)
    }

    /// Configure a physical interface registered under its internal name.
    async fn configure_physical(&self, desired: &Interface) -> Result<(), ReconcileError> {
        let (handle, current) = self.registry.lookup_by_name(&desired.name).ok_or_else(|| {
            ReconcileError::NotFound(format!("physical interface {}", desired.name))
        })?;
        if !current.kind.is_physical() {
            return Err(ReconcileError::validation(
                &desired.name,
                format!("{} is a {} interface", desired.name, current.kind),
            ));
        }

        let result = self.apply_attributes(desired, handle, Some(&current)).await;
        self.registry
            .register_name(&desired.name, handle, desired.clone());
        result
    }

    /// Converge the attributes of the object at `handle` from `current` (or
    /// from a freshly created object when `None`) to `desired`.
    async fn apply_attributes(
        &self,
        desired: &Interface,
        handle: Handle,
        current: Option<&Interface>,
    ) -> Result<(), ReconcileError> {
        let name = desired.name.as_str();
        let err = |e: DataplaneError| e.into_reconcile(name);
        let mut errors = ErrorAggregator::new();

        if let Some(mac) = &desired.phys_address {
            if current.and_then(|c| c.phys_address.as_ref()) != Some(mac) {
                let result = self.dataplane.set_phys_address(handle, mac).await;
                errors.record(name, result.map_err(err));
            }
        }

        if let Some(mtu) = desired.mtu {
            if current.and_then(|c| c.mtu) != Some(mtu) {
                let result = self.dataplane.set_mtu(handle, mtu).await;
                errors.record(name, result.map_err(err));
            }
        }

        let wanted: BTreeSet<IpPrefix> = desired.prefixes()?.into_iter().collect();
        let mut present: BTreeSet<IpPrefix> = match current {
            Some(c) => c.prefixes()?.into_iter().collect(),
            None => BTreeSet::new(),
        };

        // The table cannot change while addresses are configured.
        let vrf_changed = desired.vrf != current.map_or(0, |c| c.vrf);
        let stale: Vec<IpPrefix> = if vrf_changed {
            present.iter().copied().collect()
        } else {
            present.difference(&wanted).copied().collect()
        };
        for prefix in stale {
            let result = self.dataplane.del_address(handle, &prefix).await;
            if errors.record(name, result.map_err(err)) {
                present.remove(&prefix);
            }
        }

        if vrf_changed {
            let result = self.dataplane.set_vrf(handle, desired.vrf).await;
            errors.record(name, result.map_err(err));
        }

        for prefix in wanted.difference(&present) {
            let result = self.dataplane.add_address(handle, prefix).await;
            errors.record(name, result.map_err(err));
        }

        if desired.enabled != current.is_some_and(|c| c.enabled) {
            let result = self.dataplane.set_admin_state(handle, desired.enabled).await;
            errors.record(name, result.map_err(err));
        }

        errors.finish()
    }
}

#[async_trait]
impl Configurator for InterfaceConfigurator {
    type Desired = Interface;
    type Live = InterfaceDetails;
    type Kind = InterfaceType;

    fn registry(&self) -> &NameToIndex<Interface> {
        &self.registry
    }

    async fn lookup_live_state(
        &self,
    ) -> Result<BTreeMap<Handle, InterfaceDetails>, ReconcileError> {
        let links = self
            .dataplane
            .host_links()
            .await
            .map_err(|e| e.into_reconcile("host links"))?;
        self.afpacket.set_host_links(links);

        self.dataplane
            .dump_interfaces()
            .await
            .map_err(|e| e.into_reconcile("interface dump"))
    }

    async fn create(&self, desired: &Interface) -> Result<(), ReconcileError> {
        desired.validate()?;

        if desired.kind.is_physical() {
            return self.configure_physical(desired).await;
        }

        if self.afpacket.is_pending(desired) {
            info!(name = %desired.name, "AF_PACKET host link missing, interface pending");
            self.afpacket.park(desired.clone());
            return Ok(());
        }
        self.afpacket.unpark(&desired.name);

        self.program(desired).await.map(|_| ())
    }

    async fn modify(
        &self,
        desired: &Interface,
        handle: Handle,
        live_kind: InterfaceType,
        live: &InterfaceDetails,
    ) -> Result<Handle, ModifyError> {
        let at = |e: ReconcileError| ModifyError::at(handle, e);
        desired.validate().map_err(at)?;

        if self.afpacket.is_pending(desired) {
            self.dataplane
                .delete_interface(handle)
                .await
                .map_err(|e| at(e.into_reconcile(&desired.name)))?;
            self.registry.unregister_handle(handle);
            info!(name = %desired.name, handle = %handle, "AF_PACKET host link gone, interface pending");
            self.afpacket.park(desired.clone());
            return Ok(handle);
        }

        if desired.kind.is_physical() || live_kind.is_physical() {
            if desired.kind != live_kind {
                return Err(at(ReconcileError::validation(
                    &desired.name,
                    format!("cannot turn a {live_kind} interface into {}", desired.kind),
                )));
            }
            self.apply_attributes(desired, handle, Some(&live.interface))
                .await
                .map_err(at)?;
            return Ok(handle);
        }

        if desired.needs_recreate(&live.interface) {
            info!(
                name = %desired.name,
                handle = %handle,
                from = %live_kind,
                to = %desired.kind,
                "Interface link changed, re-creating"
            );
            self.dataplane
                .delete_interface(handle)
                .await
                .map_err(|e| at(e.into_reconcile(&desired.name)))?;
            self.registry.unregister_handle(handle);

            let new_handle = self
                .dataplane
                .create_interface(desired)
                .await
                .map_err(|e| ModifyError::gone(e.into_reconcile(&desired.name)))?;
            // The object exists now; attributes are retried on the next pass.
            if let Err(e) = self.apply_attributes(desired, new_handle, None).await {
                warn!(name = %desired.name, handle = %new_handle, error = %e, "Re-created interface left incomplete");
            }
            return Ok(new_handle);
        }

        debug!(name = %desired.name, handle = %handle, "Modifying interface");
        self.apply_attributes(desired, handle, Some(&live.interface))
            .await
            .map_err(at)?;
        Ok(handle)
    }

    async fn delete(&self, live: &InterfaceDetails, handle: Handle) -> Result<(), ReconcileError> {
        self.dataplane
            .delete_interface(handle)
            .await
            .map_err(|e| e.into_reconcile(live.internal_name()))?;
        self.registry.unregister_handle(handle);
        info!(handle = %handle, internal_name = %live.internal_name(), "Interface deleted");
        Ok(())
    }

    fn live_kind(&self, live: &InterfaceDetails) -> InterfaceType {
        live.interface.kind
    }

    fn retained(&self, handle: Handle, live: &InterfaceDetails) -> Option<(String, Interface)> {
        if handle.is_reserved() || live.interface.kind.is_physical() {
            Some((live.internal_name().to_string(), live.interface.clone()))
        } else {
            None
        }
    }

    fn is_pending(&self, desired: &Interface) -> bool {
        self.afpacket.is_pending(desired)
    }

    fn retain_pending(&self, desired: &[Interface]) {
        let dropped = self
            .afpacket
            .retain(|name| desired.iter().any(|d| d.name == name));
        for name in dropped {
            info!(name = %name, "AF_PACKET interface no longer desired, unparked");
        }
    }
}
