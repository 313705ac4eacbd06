//! BFD (bidirectional forwarding detection) descriptors.

use std::net::IpAddr;

use dpsync_reconcile::{Named, ReconcileError};
use serde::{Deserialize, Serialize};

use super::check_name;

/// Authentication settings of a single-hop session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfdSessionAuth {
    /// Configured key id (see [`BfdAuthKey::id`]).
    pub key_id: u32,
    /// Key id advertised to the peer.
    pub advertised_key_id: u8,
}

/// Single-hop BFD session, one per interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfdSession {
    /// Name of the interface the session runs on; also the session name.
    pub interface: String,
    pub source_address: IpAddr,
    pub destination_address: IpAddr,
    /// Microseconds.
    pub desired_min_tx_interval: u32,
    /// Microseconds.
    pub required_min_rx_interval: u32,
    pub detect_multiplier: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<BfdSessionAuth>,
}

impl Named for BfdSession {
    fn name(&self) -> &str {
        &self.interface
    }
}

impl BfdSession {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        check_name(&self.interface)?;
        if self.source_address.is_ipv4() != self.destination_address.is_ipv4() {
            return Err(ReconcileError::validation(
                &self.interface,
                "source and destination must share an address family",
            ));
        }
        if self.detect_multiplier == 0 {
            return Err(ReconcileError::validation(
                &self.interface,
                "detect multiplier must be positive",
            ));
        }
        if self.desired_min_tx_interval == 0 || self.required_min_rx_interval == 0 {
            return Err(ReconcileError::validation(
                &self.interface,
                "intervals must be positive",
            ));
        }
        Ok(())
    }

    /// True if the session can be updated in place to `other`.
    ///
    /// Endpoints are part of the forwarder's session key.
    pub fn same_endpoints(&self, other: &BfdSession) -> bool {
        self.source_address == other.source_address
            && self.destination_address == other.destination_address
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BfdAuthType {
    KeyedSha1,
    MeticulousKeyedSha1,
}

/// Authentication key, referenced by sessions through its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfdAuthKey {
    pub name: String,
    pub id: u32,
    pub authentication_type: BfdAuthType,
    pub secret: String,
}

impl Named for BfdAuthKey {
    fn name(&self) -> &str {
        &self.name
    }
}

impl BfdAuthKey {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        check_name(&self.name)?;
        // SHA1 keys are at most 20 bytes.
        if self.secret.is_empty() || self.secret.len() > 20 {
            return Err(ReconcileError::validation(
                &self.name,
                "secret must be between 1 and 20 bytes",
            ));
        }
        Ok(())
    }
}

/// Echo function settings; at most one per forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BfdEchoFunction {
    pub name: String,
    pub echo_source_interface: String,
}

impl Named for BfdEchoFunction {
    fn name(&self) -> &str {
        &self.name
    }
}

impl BfdEchoFunction {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        check_name(&self.name)
    }
}
