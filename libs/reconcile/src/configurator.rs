//! Per-kind configurator interfaces driven by the resync orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::ReconcileError;
use crate::registry::{Handle, NameToIndex};

/// A failed [`Configurator::modify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyError {
    pub error: ReconcileError,
    /// Handle the object lives at after the failure, `None` if it is gone.
    pub handle: Option<Handle>,
}

impl ModifyError {
    /// The object is still in place at `handle`.
    pub fn at(handle: Handle, error: ReconcileError) -> Self {
        Self {
            error,
            handle: Some(handle),
        }
    }

    /// The object was removed before the failure.
    pub fn gone(error: ReconcileError) -> Self {
        Self {
            error,
            handle: None,
        }
    }
}

/// Outcome of [`KeyedConfigurator::create_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Unchanged,
    Created,
    Updated,
}

/// A desired-state object with a caller-chosen stable name.
pub trait Named {
    fn name(&self) -> &str;
}

/// Primitive operations for a resource kind whose objects are addressed by
/// forwarder-assigned handles.
///
/// Every mutating call touches exactly one dataplane object and at most one
/// registry entry.
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Declarative descriptor, also stored as registry metadata.
    type Desired: Named + Clone + Send + Sync + 'static;

    /// Object as dumped from the forwarder.
    type Live: Send + Sync;

    /// Type discriminator of a live object.
    type Kind: fmt::Debug + Copy + Send + Sync;

    /// Registry of name/handle bindings owned by this configurator.
    fn registry(&self) -> &NameToIndex<Self::Desired>;

    /// Dump every object of this kind currently programmed in the forwarder.
    async fn lookup_live_state(&self) -> Result<BTreeMap<Handle, Self::Live>, ReconcileError>;

    /// Program a new object and register it on success.
    async fn create(&self, desired: &Self::Desired) -> Result<(), ReconcileError>;

    /// Converge the object at `handle`, currently of type `live_kind` and
    /// dumped as `live`, to `desired`.
    ///
    /// Returns the handle the object lives at afterwards, which only differs
    /// from `handle` when the kind had to be re-created. A failure reports
    /// where the object is left, if anywhere.
    async fn modify(
        &self,
        desired: &Self::Desired,
        handle: Handle,
        live_kind: Self::Kind,
        live: &Self::Live,
    ) -> Result<Handle, ModifyError>;

    /// Remove the object at `handle` and unregister it on success.
    async fn delete(&self, live: &Self::Live, handle: Handle) -> Result<(), ReconcileError>;

    /// Type discriminator of a live object.
    fn live_kind(&self, live: &Self::Live) -> Self::Kind;

    /// Objects that must never be deleted, with the forwarder-internal name
    /// and descriptor they are registered under.
    fn retained(&self, handle: Handle, live: &Self::Live) -> Option<(String, Self::Desired)>;

    /// True while `desired` waits for an external precondition and has no
    /// handle yet.
    fn is_pending(&self, _desired: &Self::Desired) -> bool {
        false
    }

    /// Forget deferred objects that are no longer in `desired`.
    ///
    /// Called once per pass, after the create step.
    fn retain_pending(&self, _desired: &[Self::Desired]) {}
}

/// Operations for a resource kind whose identity is chosen by the caller.
#[async_trait]
pub trait KeyedConfigurator: Send + Sync {
    type Desired: Named + Send + Sync;

    /// Reload the lookup cache of existing objects from the forwarder.
    async fn refresh(&self) -> Result<(), ReconcileError>;

    /// Names present in the cache after the last refresh.
    fn cached_names(&self) -> Vec<String>;

    /// Create the object or update it in place.
    async fn create_or_update(&self, desired: &Self::Desired) -> Result<Applied, ReconcileError>;

    /// Remove an object that is no longer desired.
    async fn remove(&self, name: &str) -> Result<(), ReconcileError>;
}
