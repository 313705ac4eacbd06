//! BFD configurators.
//!
//! Sessions, authentication keys and the echo function are named by the
//! configuration author, so they are converged with the keyed resync variant.
//! Sessions and the echo function reference interfaces by name and resolve
//! them through the interface registry.

mod auth_key;
mod echo;
mod session;

pub use auth_key::BfdAuthKeyConfigurator;
pub use echo::BfdEchoConfigurator;
pub use session::BfdSessionConfigurator;

use dpsync_reconcile::{Handle, NameToIndex, ReconcileError};

use crate::model::Interface;

/// Resolve an interface name to its software interface index.
fn resolve_interface(
    interfaces: &NameToIndex<Interface>,
    name: &str,
) -> Result<Handle, ReconcileError> {
    interfaces
        .lookup_by_name(name)
        .map(|(handle, _)| handle)
        .ok_or_else(|| ReconcileError::NotFound(format!("interface {name}")))
}
