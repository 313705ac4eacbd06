//! Local state persistence for the dataplane agent.
//!
//! Registry snapshots are kept in SQLite so the agent can correlate desired
//! names with forwarder handles after a restart.

mod persister;
mod store;

pub use persister::RegistryPersister;
pub use store::{SqliteSnapshotStore, StateStoreError};
