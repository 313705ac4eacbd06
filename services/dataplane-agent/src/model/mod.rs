//! Desired-state and live-state descriptors.

mod bfd;
mod interface;

use std::fmt;

use dpsync_reconcile::ReconcileError;

pub use bfd::{BfdAuthKey, BfdAuthType, BfdEchoFunction, BfdSession, BfdSessionAuth};
pub use interface::{
    AfPacketLink, Interface, InterfaceType, IpPrefix, MemifLink, TapLink, VxlanLink,
};

/// Prefix of the names given to forwarder objects the agent cannot name.
///
/// Desired objects may not use it, so these names never shadow one.
pub const UNNAMED_PREFIX: &str = "unnamed/";

/// Name for a forwarder object of `kind` found without a registered name.
pub fn unnamed(kind: &str, id: impl fmt::Display) -> String {
    format!("{UNNAMED_PREFIX}{kind}-{id}")
}

fn check_name(name: &str) -> Result<(), ReconcileError> {
    if name.starts_with(UNNAMED_PREFIX) {
        return Err(ReconcileError::validation(
            name,
            format!("names starting with {UNNAMED_PREFIX:?} are reserved"),
        ));
    }
    Ok(())
}
