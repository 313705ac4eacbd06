//! Agent wiring: one orchestrator per resource kind.

use std::sync::Arc;

use dpsync_reconcile::{
    Configurator, KeyedResync, NameToIndex, PassSummary, ReconcileError, Resync, SnapshotStore,
};
use tracing::{info, warn};

use crate::bfdplugin::{BfdAuthKeyConfigurator, BfdEchoConfigurator, BfdSessionConfigurator};
use crate::dataplane::Dataplane;
use crate::desired::DesiredState;
use crate::ifplugin::InterfaceConfigurator;
use crate::model::{BfdAuthKey, BfdEchoFunction, BfdSession, Interface};
use crate::state::RegistryPersister;

/// Outcome of one agent-wide resync, per resource kind.
#[derive(Debug)]
pub struct ResyncReport {
    pub interfaces: Result<PassSummary, ReconcileError>,
    pub bfd_keys: Result<PassSummary, ReconcileError>,
    pub bfd_sessions: Result<PassSummary, ReconcileError>,
    pub bfd_echo: Result<PassSummary, ReconcileError>,
}

impl ResyncReport {
    fn kinds(&self) -> [(&'static str, &Result<PassSummary, ReconcileError>); 4] {
        [
            ("interfaces", &self.interfaces),
            ("bfd_keys", &self.bfd_keys),
            ("bfd_sessions", &self.bfd_sessions),
            ("bfd_echo", &self.bfd_echo),
        ]
    }

    /// True if every kind converged without errors.
    pub fn is_ok(&self) -> bool {
        self.kinds().iter().all(|(_, r)| r.is_ok())
    }

    /// Last error in resync order, if any.
    pub fn last_error(&self) -> Option<&ReconcileError> {
        self.kinds()
            .into_iter()
            .filter_map(|(_, r)| r.as_ref().err())
            .last()
    }
}

/// Dataplane agent: converges interfaces and BFD configuration.
pub struct DataplaneAgent {
    label: String,
    store: Arc<dyn SnapshotStore>,
    interfaces: Resync<InterfaceConfigurator>,
    bfd_keys: KeyedResync<BfdAuthKeyConfigurator>,
    bfd_sessions: KeyedResync<BfdSessionConfigurator>,
    bfd_echo: KeyedResync<BfdEchoConfigurator>,
}

impl DataplaneAgent {
    /// Create an agent persisting its interface registry under `label`.
    pub fn new(
        dataplane: Arc<dyn Dataplane>,
        store: Arc<dyn SnapshotStore>,
        label: impl Into<String>,
    ) -> Self {
        let label = label.into();
        let interfaces = Arc::new(InterfaceConfigurator::new(dataplane.clone()));

        Self {
            bfd_keys: KeyedResync::new(Arc::new(BfdAuthKeyConfigurator::new(dataplane.clone()))),
            bfd_sessions: KeyedResync::new(Arc::new(BfdSessionConfigurator::new(
                dataplane.clone(),
                interfaces.clone(),
            ))),
            bfd_echo: KeyedResync::new(Arc::new(BfdEchoConfigurator::new(
                dataplane,
                interfaces.clone(),
            ))),
            interfaces: Resync::new(interfaces, store.clone(), &label),
            store,
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn interface_configurator(&self) -> &Arc<InterfaceConfigurator> {
        self.interfaces.configurator()
    }

    pub fn interfaces(&self) -> &NameToIndex<Interface> {
        self.interfaces.configurator().registry()
    }

    pub fn bfd_keys(&self) -> &NameToIndex<BfdAuthKey> {
        self.bfd_keys.configurator().registry()
    }

    pub fn bfd_sessions(&self) -> &NameToIndex<BfdSession> {
        self.bfd_sessions.configurator().registry()
    }

    pub fn bfd_echo(&self) -> &NameToIndex<BfdEchoFunction> {
        self.bfd_echo.configurator().registry()
    }

    /// Persister for the interface registry, under the key the first pass
    /// correlates against.
    pub fn interface_persister(&self) -> RegistryPersister {
        RegistryPersister::new(self.store.clone(), self.interfaces.snapshot_key())
    }

    /// Whether the restart correlation has happened.
    pub async fn first_pass_done(&self) -> bool {
        self.interfaces.first_pass_done().await
    }

    /// Converge every resource kind to `desired`.
    ///
    /// Interfaces go first since BFD references them by name; keys precede
    /// the sessions that use them.
    pub async fn resync(&self, desired: &DesiredState) -> ResyncReport {
        let interfaces = self.interfaces.run(&desired.interfaces).await;
        let bfd_keys = self.bfd_keys.run(&desired.bfd_keys).await;
        let bfd_sessions = self.bfd_sessions.run(&desired.bfd_sessions).await;
        let bfd_echo = self.bfd_echo.run(&desired.bfd_echo).await;

        let report = ResyncReport {
            interfaces,
            bfd_keys,
            bfd_sessions,
            bfd_echo,
        };
        for (kind, result) in report.kinds() {
            match result {
                Ok(summary) => info!(label = %self.label, kind, %summary, "Resync complete"),
                Err(e) => warn!(label = %self.label, kind, error = %e, "Resync finished with errors"),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::MockDataplane;
    use dpsync_reconcile::MemorySnapshotStore;

    #[tokio::test]
    async fn test_report_collects_errors() {
        let dp = Arc::new(MockDataplane::new());
        let agent = DataplaneAgent::new(dp.clone(), Arc::new(MemorySnapshotStore::new()), "agent");

        dp.fail("dump_bfd_keys");
        let report = agent.resync(&DesiredState::default()).await;

        assert!(report.interfaces.is_ok());
        assert!(!report.is_ok());
        assert!(matches!(
            report.last_error(),
            Some(ReconcileError::Rejected { .. })
        ));
        assert!(agent.first_pass_done().await);
        assert_eq!(agent.interfaces().names(), vec!["local0"]);
    }

    #[test]
    fn test_persister_key_matches_resync() {
        let agent = DataplaneAgent::new(
            Arc::new(MockDataplane::new()),
            Arc::new(MemorySnapshotStore::new()),
            "node-1",
        );
        assert_eq!(agent.interface_persister().key(), "node-1/sw_if_indexes");
    }
}
