//! Interface descriptors.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use dpsync_reconcile::{Named, ReconcileError};
use serde::{Deserialize, Serialize};

/// Interface type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    /// Software loopback (also the forwarder's built-in `local0`).
    SoftwareLoopback,
    /// Physical NIC; created by the forwarder at startup, never by the agent.
    EthernetCsmacd,
    /// TAP device shared with the host kernel.
    Tap,
    /// AF_PACKET socket bound to a host-side link.
    AfPacket,
    /// Shared-memory packet interface.
    Memif,
    /// VXLAN tunnel endpoint.
    VxlanTunnel,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoftwareLoopback => "software_loopback",
            Self::EthernetCsmacd => "ethernet_csmacd",
            Self::Tap => "tap",
            Self::AfPacket => "af_packet",
            Self::Memif => "memif",
            Self::VxlanTunnel => "vxlan_tunnel",
        }
    }

    /// Returns true for interfaces backed by hardware.
    pub fn is_physical(&self) -> bool {
        matches!(self, Self::EthernetCsmacd)
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address with prefix length, e.g. `10.0.0.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl FromStr for IpPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in {s:?}"))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid address {addr:?}: {e}"))?;
        let len: u8 = len
            .parse()
            .map_err(|e| format!("invalid prefix length {len:?}: {e}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(format!("prefix length {len} exceeds {max}"));
        }
        Ok(Self { addr, len })
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapLink {
    pub host_if_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfPacketLink {
    pub host_if_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemifLink {
    #[serde(default)]
    pub master: bool,
    pub id: u32,
    pub socket_filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanLink {
    pub src_address: IpAddr,
    pub dst_address: IpAddr,
    pub vni: u32,
}

fn default_enabled() -> bool {
    true
}

/// Declarative interface configuration.
///
/// Also used for the forwarder's view of an interface, in which case `name`
/// is the forwarder-internal name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: InterfaceType,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phys_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default)]
    pub vrf: u32,

    #[serde(default)]
    pub ip_addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<TapLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub afpacket: Option<AfPacketLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memif: Option<MemifLink>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxlan: Option<VxlanLink>,
}

impl Named for Interface {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Interface {
    /// An enabled interface with no addresses or link configuration.
    pub fn new(name: impl Into<String>, kind: InterfaceType) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            phys_address: None,
            mtu: None,
            vrf: 0,
            ip_addresses: Vec::new(),
            tap: None,
            afpacket: None,
            memif: None,
            vxlan: None,
        }
    }

    pub fn tap(name: impl Into<String>, host_if_name: impl Into<String>) -> Self {
        Self {
            tap: Some(TapLink {
                host_if_name: host_if_name.into(),
            }),
            ..Self::new(name, InterfaceType::Tap)
        }
    }

    pub fn afpacket(name: impl Into<String>, host_if_name: impl Into<String>) -> Self {
        Self {
            afpacket: Some(AfPacketLink {
                host_if_name: host_if_name.into(),
            }),
            ..Self::new(name, InterfaceType::AfPacket)
        }
    }

    pub fn with_addresses(mut self, addresses: &[&str]) -> Self {
        self.ip_addresses = addresses.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_vrf(mut self, vrf: u32) -> Self {
        self.vrf = vrf;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Parsed IP addresses, sorted.
    pub fn prefixes(&self) -> Result<Vec<IpPrefix>, ReconcileError> {
        let mut prefixes = self
            .ip_addresses
            .iter()
            .map(|a| {
                a.parse::<IpPrefix>()
                    .map_err(|reason| ReconcileError::validation(&self.name, reason))
            })
            .collect::<Result<Vec<_>, _>>()?;
        prefixes.sort();
        prefixes.dedup();
        Ok(prefixes)
    }

    /// Check the descriptor is complete for its type.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.name.is_empty() {
            return Err(ReconcileError::validation("<unnamed>", "interface name is empty"));
        }
        super::check_name(&self.name)?;
        let missing = match self.kind {
            InterfaceType::Tap => self.tap.is_none(),
            InterfaceType::AfPacket => self.afpacket.is_none(),
            InterfaceType::Memif => self.memif.is_none(),
            InterfaceType::VxlanTunnel => self.vxlan.is_none(),
            InterfaceType::SoftwareLoopback | InterfaceType::EthernetCsmacd => false,
        };
        if missing {
            return Err(ReconcileError::validation(
                &self.name,
                format!("{} interface requires its link section", self.kind),
            ));
        }
        if let Some(vxlan) = &self.vxlan {
            if vxlan.src_address.is_ipv4() != vxlan.dst_address.is_ipv4() {
                return Err(ReconcileError::validation(
                    &self.name,
                    "vxlan endpoints must share an address family",
                ));
            }
        }
        if let Some(mac) = &self.phys_address {
            if !is_mac(mac) {
                return Err(ReconcileError::validation(
                    &self.name,
                    format!("invalid physical address {mac:?}"),
                ));
            }
        }
        self.prefixes().map(|_| ())
    }

    /// True if turning `live` into `self` needs delete + create.
    ///
    /// Link parameters are fixed at creation time in the forwarder.
    pub fn needs_recreate(&self, live: &Interface) -> bool {
        if self.kind != live.kind {
            return true;
        }
        match self.kind {
            InterfaceType::Tap => self.tap != live.tap,
            InterfaceType::AfPacket => self.afpacket != live.afpacket,
            InterfaceType::Memif => self.memif != live.memif,
            InterfaceType::VxlanTunnel => self.vxlan != live.vxlan,
            InterfaceType::SoftwareLoopback | InterfaceType::EthernetCsmacd => false,
        }
    }
}

fn is_mac(s: &str) -> bool {
    let octets: Vec<&str> = s.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}
