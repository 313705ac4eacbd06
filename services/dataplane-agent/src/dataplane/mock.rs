//! In-memory forwarder.
//!
//! Behaves like a freshly started forwarder: `local0` exists at handle 0,
//! physical NICs can be seeded, and every mutation is checked the way the
//! real API checks it. Failures can be injected per operation, optionally
//! narrowed to one target (`"delete_interface:7"`).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dpsync_reconcile::Handle;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{BfdKeyDetails, BfdSessionDetails, Dataplane, DataplaneError, InterfaceDetails};
use crate::model::{BfdAuthKey, Interface, InterfaceType, IpPrefix};

struct MockState {
    interfaces: BTreeMap<Handle, Interface>,
    next_index: u32,
    host_links: BTreeSet<String>,
    bfd_sessions: BTreeMap<Handle, BfdSessionDetails>,
    bfd_keys: BTreeMap<u32, BfdKeyDetails>,
    echo_source: Option<Handle>,
}

impl MockState {
    fn new() -> Self {
        let mut local0 = Interface::new("local0", InterfaceType::SoftwareLoopback);
        local0.enabled = false;

        let mut interfaces = BTreeMap::new();
        interfaces.insert(Handle::RESERVED, local0);

        Self {
            interfaces,
            next_index: 1,
            host_links: BTreeSet::new(),
            bfd_sessions: BTreeMap::new(),
            bfd_keys: BTreeMap::new(),
            echo_source: None,
        }
    }

    fn interface_mut(&mut self, handle: Handle) -> Result<&mut Interface, DataplaneError> {
        self.interfaces
            .get_mut(&handle)
            .ok_or_else(|| DataplaneError::NotFound(format!("sw_if_index {handle}")))
    }

    fn allocate(&mut self) -> Handle {
        let handle = Handle(self.next_index);
        self.next_index += 1;
        handle
    }
}

/// In-memory forwarder for development and testing.
pub struct MockDataplane {
    state: Mutex<MockState>,
    unreachable: AtomicBool,
    failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockDataplane {
    /// A forwarder with only `local0`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::new()),
            unreachable: AtomicBool::new(false),
            failures: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Add a physical NIC, as the forwarder does for bound PCI devices.
    pub fn with_physical(self, internal_name: &str) -> Self {
        {
            let mut state = self.state.lock();
            let handle = state.allocate();
            let mut nic = Interface::new(internal_name, InterfaceType::EthernetCsmacd);
            nic.enabled = false;
            state.interfaces.insert(handle, nic);
        }
        self
    }

    pub fn with_host_link(self, name: &str) -> Self {
        self.add_host_link(name);
        self
    }

    /// Make a host-side link appear.
    pub fn add_host_link(&self, name: &str) {
        self.state.lock().host_links.insert(name.to_string());
    }

    /// Make a host-side link disappear.
    pub fn remove_host_link(&self, name: &str) {
        self.state.lock().host_links.remove(name);
    }

    /// Simulate a lost API connection.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Reject every call of `operation`, or only those aimed at one target
    /// when given as `"operation:target"`.
    pub fn fail(&self, operation: &str) {
        self.failures.lock().insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Remove an interface behind the agent's back.
    pub fn remove_out_of_band(&self, handle: Handle) {
        let mut state = self.state.lock();
        state.interfaces.remove(&handle);
        state.bfd_sessions.remove(&handle);
    }

    /// Operations invoked so far, as `"operation:target"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of calls of `operation`.
    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split(':').next() == Some(operation))
            .count()
    }

    /// Current forwarder view of one interface.
    pub fn interface(&self, handle: Handle) -> Option<Interface> {
        self.state.lock().interfaces.get(&handle).cloned()
    }

    /// Number of interfaces, including `local0`.
    pub fn interface_count(&self) -> usize {
        self.state.lock().interfaces.len()
    }

    pub fn bfd_session(&self, sw_if_index: Handle) -> Option<BfdSessionDetails> {
        self.state.lock().bfd_sessions.get(&sw_if_index).cloned()
    }

    pub fn bfd_key_ids(&self) -> Vec<u32> {
        self.state.lock().bfd_keys.keys().copied().collect()
    }

    fn check(&self, operation: &str, target: impl std::fmt::Display) -> Result<(), DataplaneError> {
        let call = format!("{operation}:{target}");
        self.calls.lock().push(call.clone());

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DataplaneError::Unreachable(
                "[MOCK] API socket closed".to_string(),
            ));
        }
        let failures = self.failures.lock();
        if failures.contains(operation) || failures.contains(&call) {
            return Err(DataplaneError::Rejected {
                retval: -1,
                message: format!("[MOCK] {operation} configured to fail"),
            });
        }
        Ok(())
    }
}

impl Default for MockDataplane {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(retval: i32, message: impl Into<String>) -> DataplaneError {
    DataplaneError::Rejected {
        retval,
        message: message.into(),
    }
}

#[async_trait]
impl Dataplane for MockDataplane {
    async fn dump_interfaces(&self) -> Result<BTreeMap<Handle, InterfaceDetails>, DataplaneError> {
        self.check("dump_interfaces", "*")?;
        let state = self.state.lock();
        Ok(state
            .interfaces
            .iter()
            .map(|(handle, iface)| {
                (
                    *handle,
                    InterfaceDetails {
                        handle: *handle,
                        interface: iface.clone(),
                    },
                )
            })
            .collect())
    }

    async fn create_interface(&self, spec: &Interface) -> Result<Handle, DataplaneError> {
        self.check("create_interface", &spec.name)?;
        let mut state = self.state.lock();

        let internal_name = match spec.kind {
            InterfaceType::EthernetCsmacd => {
                return Err(rejected(-3, "physical interfaces cannot be created"));
            }
            InterfaceType::AfPacket => {
                let host = spec
                    .afpacket
                    .as_ref()
                    .map(|l| l.host_if_name.clone())
                    .unwrap_or_default();
                if !state.host_links.contains(&host) {
                    return Err(rejected(-2, format!("host interface {host} not found")));
                }
                format!("host-{host}")
            }
            InterfaceType::SoftwareLoopback => format!("loop{}", state.next_index),
            InterfaceType::Tap => format!("tap{}", state.next_index),
            InterfaceType::Memif => format!("memif{}", state.next_index),
            InterfaceType::VxlanTunnel => format!("vxlan_tunnel{}", state.next_index),
        };

        let handle = state.allocate();
        let mut iface = Interface::new(internal_name, spec.kind);
        iface.enabled = false;
        iface.tap = spec.tap.clone();
        iface.afpacket = spec.afpacket.clone();
        iface.memif = spec.memif.clone();
        iface.vxlan = spec.vxlan.clone();

        info!(
            handle = %handle,
            internal_name = %iface.name,
            kind = %spec.kind,
            "[MOCK] Interface created"
        );
        state.interfaces.insert(handle, iface);
        Ok(handle)
    }

    async fn delete_interface(&self, handle: Handle) -> Result<(), DataplaneError> {
        self.check("delete_interface", handle)?;
        let mut state = self.state.lock();

        let kind = state.interface_mut(handle)?.kind;
        if handle.is_reserved() || kind.is_physical() {
            return Err(rejected(-4, "interface cannot be deleted"));
        }
        state.interfaces.remove(&handle);
        state.bfd_sessions.remove(&handle);
        if state.echo_source == Some(handle) {
            state.echo_source = None;
        }

        info!(handle = %handle, "[MOCK] Interface deleted");
        Ok(())
    }

    async fn set_admin_state(&self, handle: Handle, up: bool) -> Result<(), DataplaneError> {
        self.check("set_admin_state", handle)?;
        self.state.lock().interface_mut(handle)?.enabled = up;
        debug!(handle = %handle, up, "[MOCK] Admin state set");
        Ok(())
    }

    async fn set_phys_address(&self, handle: Handle, mac: &str) -> Result<(), DataplaneError> {
        self.check("set_phys_address", handle)?;
        self.state.lock().interface_mut(handle)?.phys_address = Some(mac.to_string());
        Ok(())
    }

    async fn set_mtu(&self, handle: Handle, mtu: u32) -> Result<(), DataplaneError> {
        self.check("set_mtu", handle)?;
        if !(64..=9216).contains(&mtu) {
            return Err(rejected(-5, format!("mtu {mtu} out of range")));
        }
        self.state.lock().interface_mut(handle)?.mtu = Some(mtu);
        Ok(())
    }

    async fn set_vrf(&self, handle: Handle, vrf: u32) -> Result<(), DataplaneError> {
        self.check("set_vrf", handle)?;
        let mut state = self.state.lock();
        let iface = state.interface_mut(handle)?;
        if !iface.ip_addresses.is_empty() {
            return Err(rejected(-6, "cannot change table with addresses configured"));
        }
        iface.vrf = vrf;
        Ok(())
    }

    async fn add_address(&self, handle: Handle, prefix: &IpPrefix) -> Result<(), DataplaneError> {
        self.check("add_address", handle)?;
        let mut state = self.state.lock();
        let iface = state.interface_mut(handle)?;
        let address = prefix.to_string();
        if iface.ip_addresses.contains(&address) {
            return Err(rejected(-7, format!("address {address} already present")));
        }
        iface.ip_addresses.push(address);
        Ok(())
    }

    async fn del_address(&self, handle: Handle, prefix: &IpPrefix) -> Result<(), DataplaneError> {
        self.check("del_address", handle)?;
        let mut state = self.state.lock();
        let iface = state.interface_mut(handle)?;
        let address = prefix.to_string();
        let before = iface.ip_addresses.len();
        iface.ip_addresses.retain(|a| *a != address);
        if iface.ip_addresses.len() == before {
            return Err(DataplaneError::NotFound(format!("address {address}")));
        }
        Ok(())
    }

    async fn host_links(&self) -> Result<BTreeSet<String>, DataplaneError> {
        self.check("host_links", "*")?;
        Ok(self.state.lock().host_links.clone())
    }

    async fn dump_bfd_sessions(&self) -> Result<Vec<BfdSessionDetails>, DataplaneError> {
        self.check("dump_bfd_sessions", "*")?;
        Ok(self.state.lock().bfd_sessions.values().cloned().collect())
    }

    async fn add_bfd_session(&self, session: &BfdSessionDetails) -> Result<(), DataplaneError> {
        self.check("add_bfd_session", session.sw_if_index)?;
        let mut state = self.state.lock();
        if !state.interfaces.contains_key(&session.sw_if_index) {
            return Err(DataplaneError::NotFound(format!(
                "sw_if_index {}",
                session.sw_if_index
            )));
        }
        if state.bfd_sessions.contains_key(&session.sw_if_index) {
            return Err(rejected(-8, "session already exists"));
        }
        if let Some(auth) = &session.authentication {
            if !state.bfd_keys.contains_key(&auth.key_id) {
                return Err(rejected(-9, format!("key {} not configured", auth.key_id)));
            }
        }
        state
            .bfd_sessions
            .insert(session.sw_if_index, session.clone());
        info!(sw_if_index = %session.sw_if_index, "[MOCK] BFD session added");
        Ok(())
    }

    async fn modify_bfd_session(
        &self,
        session: &BfdSessionDetails,
    ) -> Result<(), DataplaneError> {
        self.check("modify_bfd_session", session.sw_if_index)?;
        let mut state = self.state.lock();
        let existing = state
            .bfd_sessions
            .get_mut(&session.sw_if_index)
            .ok_or_else(|| DataplaneError::NotFound("bfd session".to_string()))?;
        if existing.source_address != session.source_address
            || existing.destination_address != session.destination_address
        {
            return Err(rejected(-10, "session endpoints cannot change"));
        }
        *existing = session.clone();
        Ok(())
    }

    async fn delete_bfd_session(&self, sw_if_index: Handle) -> Result<(), DataplaneError> {
        self.check("delete_bfd_session", sw_if_index)?;
        self.state
            .lock()
            .bfd_sessions
            .remove(&sw_if_index)
            .map(|_| ())
            .ok_or_else(|| DataplaneError::NotFound("bfd session".to_string()))
    }

    async fn dump_bfd_keys(&self) -> Result<Vec<BfdKeyDetails>, DataplaneError> {
        self.check("dump_bfd_keys", "*")?;
        Ok(self.state.lock().bfd_keys.values().copied().collect())
    }

    async fn set_bfd_key(&self, key: &BfdAuthKey) -> Result<(), DataplaneError> {
        self.check("set_bfd_key", key.id)?;
        self.state.lock().bfd_keys.insert(
            key.id,
            BfdKeyDetails {
                id: key.id,
                authentication_type: key.authentication_type,
            },
        );
        Ok(())
    }

    async fn delete_bfd_key(&self, id: u32) -> Result<(), DataplaneError> {
        self.check("delete_bfd_key", id)?;
        let mut state = self.state.lock();
        let in_use = state
            .bfd_sessions
            .values()
            .any(|s| s.authentication.map(|a| a.key_id) == Some(id));
        if in_use {
            return Err(rejected(-11, format!("key {id} in use")));
        }
        state
            .bfd_keys
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DataplaneError::NotFound(format!("bfd key {id}")))
    }

    async fn bfd_echo_source(&self) -> Result<Option<Handle>, DataplaneError> {
        self.check("bfd_echo_source", "*")?;
        Ok(self.state.lock().echo_source)
    }

    async fn set_bfd_echo_source(&self, sw_if_index: Handle) -> Result<(), DataplaneError> {
        self.check("set_bfd_echo_source", sw_if_index)?;
        let mut state = self.state.lock();
        if !state.interfaces.contains_key(&sw_if_index) {
            return Err(DataplaneError::NotFound(format!("sw_if_index {sw_if_index}")));
        }
        state.echo_source = Some(sw_if_index);
        Ok(())
    }

    async fn delete_bfd_echo_source(&self) -> Result<(), DataplaneError> {
        self.check("delete_bfd_echo_source", "*")?;
        self.state.lock().echo_source = None;
        Ok(())
    }
}
