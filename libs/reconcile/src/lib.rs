//! Dataplane resync primitives.
//!
//! This library converges a forwarder's live objects to a desired object set.
//! Key concepts:
//!
//! - **Desired state**: objects named by the configuration author.
//! - **Live state**: objects dumped from the forwarder, addressed by handles
//!   the forwarder assigned and that do not survive a forwarder restart.
//! - **Correlation**: recovering which live handle carries which desired name,
//!   using a registry snapshot persisted by the previous agent process.
//!
//! # Invariants
//!
//! - Within a pass: delete, then modify, then create
//! - Every desired object and every obsolete live object is attempted once
//! - A failure on one object never stops the pass; the last failure is returned
//! - The handle `0` default resource and physical resources are never deleted

pub mod configurator;
pub mod error;
pub mod persist;
pub mod registry;
pub mod resync;

use std::time::Duration;

pub use configurator::{Applied, Configurator, KeyedConfigurator, ModifyError, Named};
pub use error::{ErrorAggregator, ReconcileError};
pub use persist::{MemorySnapshotStore, Snapshot, SnapshotEntry, SnapshotStore};
pub use registry::{Entry, Handle, Indexer, NameToIndex, RegistryEvent};
pub use resync::{snapshot_key, KeyedResync, PassSummary, Resync};

/// Default interval between periodic resync passes.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default upper bound for a single pass.
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(60);
