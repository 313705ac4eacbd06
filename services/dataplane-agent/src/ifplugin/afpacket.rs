//! AF_PACKET host-link tracking.
//!
//! An AF_PACKET interface binds to a host-side link. Until that link exists
//! the interface cannot be created; it is parked here and replayed once the
//! link shows up.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::model::{Interface, InterfaceType};

#[derive(Default)]
struct Inner {
    host_links: BTreeSet<String>,
    /// Parked interfaces by name.
    pending: BTreeMap<String, Interface>,
}

/// Host links known to exist and AF_PACKET interfaces waiting for one.
#[derive(Default)]
pub struct AfPacketTracker {
    inner: Mutex<Inner>,
}

fn host_if_name(iface: &Interface) -> Option<&str> {
    iface.afpacket.as_ref().map(|l| l.host_if_name.as_str())
}

impl AfPacketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known host links with a fresh listing.
    pub fn set_host_links(&self, links: BTreeSet<String>) {
        self.inner.lock().host_links = links;
    }

    /// True if `iface` is an AF_PACKET interface whose host link is missing.
    pub fn is_pending(&self, iface: &Interface) -> bool {
        if iface.kind != InterfaceType::AfPacket {
            return false;
        }
        match host_if_name(iface) {
            Some(host) => !self.inner.lock().host_links.contains(host),
            None => false,
        }
    }

    /// Park `iface` until its host link appears.
    pub fn park(&self, iface: Interface) {
        self.inner.lock().pending.insert(iface.name.clone(), iface);
    }

    /// Forget a parked interface.
    pub fn unpark(&self, name: &str) -> Option<Interface> {
        self.inner.lock().pending.remove(name)
    }

    /// Record a new host link and return the interfaces waiting for it.
    pub fn link_added(&self, host: &str) -> Vec<Interface> {
        let mut inner = self.inner.lock();
        inner.host_links.insert(host.to_string());

        let ready: Vec<String> = inner
            .pending
            .values()
            .filter(|iface| host_if_name(iface) == Some(host))
            .map(|iface| iface.name.clone())
            .collect();
        ready
            .iter()
            .filter_map(|name| inner.pending.remove(name))
            .collect()
    }

    /// Record that a host link went away.
    pub fn link_removed(&self, host: &str) {
        self.inner.lock().host_links.remove(host);
    }

    /// Drop parked interfaces for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.inner.lock().pending.retain(|name, _| {
            let kept = keep(name);
            if !kept {
                dropped.push(name.clone());
            }
            kept
        });
        dropped
    }

    /// Host links appeared and disappeared in `links` since the last update.
    pub fn diff_host_links(&self, links: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
        let inner = self.inner.lock();
        let added = links.difference(&inner.host_links).cloned().collect();
        let removed = inner.host_links.difference(links).cloned().collect();
        (added, removed)
    }

    /// Names of parked interfaces, sorted.
    pub fn pending_names(&self) -> Vec<String> {
        self.inner.lock().pending.keys().cloned().collect()
    }
}
