//! Forwarder API abstraction.
//!
//! The agent never talks to the forwarder directly; every dump and mutation
//! goes through [`Dataplane`]. The binary API transport is outside this
//! crate. [`MockDataplane`] is an in-memory forwarder for development and
//! tests.

mod mock;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use async_trait::async_trait;
use dpsync_reconcile::{Handle, ReconcileError};
use thiserror::Error;

use crate::model::{BfdAuthKey, BfdAuthType, BfdSession, BfdSessionAuth, Interface, IpPrefix};

pub use mock::MockDataplane;

/// Errors returned by the forwarder API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataplaneError {
    #[error("dataplane unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected (retval {retval}): {message}")]
    Rejected { retval: i32, message: String },

    #[error("no such object: {0}")]
    NotFound(String),
}

impl DataplaneError {
    /// Attribute the error to the named object.
    pub fn into_reconcile(self, object: &str) -> ReconcileError {
        match self {
            Self::Unreachable(reason) => ReconcileError::Transport(reason),
            Self::Rejected { retval, message } => {
                ReconcileError::rejected(object, format!("{message} (retval {retval})"))
            }
            Self::NotFound(what) => ReconcileError::NotFound(format!("{object}: {what}")),
        }
    }
}

/// One interface as dumped from the forwarder.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDetails {
    pub handle: Handle,
    /// Forwarder view; `name` is the forwarder-internal name.
    pub interface: Interface,
}

impl InterfaceDetails {
    pub fn internal_name(&self) -> &str {
        &self.interface.name
    }
}

/// One BFD session as dumped from the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfdSessionDetails {
    pub sw_if_index: Handle,
    pub source_address: IpAddr,
    pub destination_address: IpAddr,
    pub desired_min_tx_interval: u32,
    pub required_min_rx_interval: u32,
    pub detect_multiplier: u8,
    pub authentication: Option<BfdSessionAuth>,
}

impl BfdSessionDetails {
    pub fn from_session(sw_if_index: Handle, session: &BfdSession) -> Self {
        Self {
            sw_if_index,
            source_address: session.source_address,
            destination_address: session.destination_address,
            desired_min_tx_interval: session.desired_min_tx_interval,
            required_min_rx_interval: session.required_min_rx_interval,
            detect_multiplier: session.detect_multiplier,
            authentication: session.authentication,
        }
    }

    /// Rebuild the declarative form for the interface named `interface`.
    pub fn to_session(&self, interface: &str) -> BfdSession {
        BfdSession {
            interface: interface.to_string(),
            source_address: self.source_address,
            destination_address: self.destination_address,
            desired_min_tx_interval: self.desired_min_tx_interval,
            required_min_rx_interval: self.required_min_rx_interval,
            detect_multiplier: self.detect_multiplier,
            authentication: self.authentication,
        }
    }
}

/// One configured BFD key. The forwarder never dumps secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BfdKeyDetails {
    pub id: u32,
    pub authentication_type: BfdAuthType,
}

/// Forwarder API used by the configurators.
#[async_trait]
pub trait Dataplane: Send + Sync {
    async fn dump_interfaces(&self) -> Result<BTreeMap<Handle, InterfaceDetails>, DataplaneError>;

    /// Create the type-specific interface object; attributes are set separately.
    async fn create_interface(&self, spec: &Interface) -> Result<Handle, DataplaneError>;

    async fn delete_interface(&self, handle: Handle) -> Result<(), DataplaneError>;

    async fn set_admin_state(&self, handle: Handle, up: bool) -> Result<(), DataplaneError>;

    async fn set_phys_address(&self, handle: Handle, mac: &str) -> Result<(), DataplaneError>;

    async fn set_mtu(&self, handle: Handle, mtu: u32) -> Result<(), DataplaneError>;

    async fn set_vrf(&self, handle: Handle, vrf: u32) -> Result<(), DataplaneError>;

    async fn add_address(&self, handle: Handle, prefix: &IpPrefix) -> Result<(), DataplaneError>;

    async fn del_address(&self, handle: Handle, prefix: &IpPrefix) -> Result<(), DataplaneError>;

    /// Host-side links AF_PACKET interfaces can bind to.
    async fn host_links(&self) -> Result<BTreeSet<String>, DataplaneError>;

    async fn dump_bfd_sessions(&self) -> Result<Vec<BfdSessionDetails>, DataplaneError>;

    async fn add_bfd_session(&self, session: &BfdSessionDetails) -> Result<(), DataplaneError>;

    async fn modify_bfd_session(&self, session: &BfdSessionDetails)
        -> Result<(), DataplaneError>;

    async fn delete_bfd_session(&self, sw_if_index: Handle) -> Result<(), DataplaneError>;

    async fn dump_bfd_keys(&self) -> Result<Vec<BfdKeyDetails>, DataplaneError>;

    async fn set_bfd_key(&self, key: &BfdAuthKey) -> Result<(), DataplaneError>;

    async fn delete_bfd_key(&self, id: u32) -> Result<(), DataplaneError>;

    async fn bfd_echo_source(&self) -> Result<Option<Handle>, DataplaneError>;

    async fn set_bfd_echo_source(&self, sw_if_index: Handle) -> Result<(), DataplaneError>;

    async fn delete_bfd_echo_source(&self) -> Result<(), DataplaneError>;
}
