//! Reconciliation loop for converging the forwarder.
//!
//! The reconciler:
//! - Periodically loads the desired state
//! - Runs one agent-wide resync pass, bounded by a timeout
//! - Skips the pass when the desired state cannot be loaded
//! - Polls host links between passes so AF_PACKET interfaces follow them

use std::sync::Arc;
use std::time::Duration;

use dpsync_reconcile::{DEFAULT_PASS_TIMEOUT, DEFAULT_RESYNC_INTERVAL};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent::{DataplaneAgent, ResyncReport};
use crate::config::Config;
use crate::desired::DesiredStateSource;

/// Default interval between host link polls.
pub const DEFAULT_HOST_LINK_INTERVAL: Duration = Duration::from_secs(5);

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between resync passes.
    pub resync_interval: Duration,

    /// Upper bound for a single pass.
    pub pass_timeout: Duration,

    /// Interval between host link polls.
    pub host_link_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            pass_timeout: DEFAULT_PASS_TIMEOUT,
            host_link_interval: DEFAULT_HOST_LINK_INTERVAL,
        }
    }
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            resync_interval: Duration::from_secs(config.resync_interval_secs),
            pass_timeout: Duration::from_secs(config.pass_timeout_secs),
            host_link_interval: Duration::from_secs(config.host_link_interval_secs),
        }
    }
}

/// Reconciler driving periodic resync passes.
pub struct Reconciler {
    agent: Arc<DataplaneAgent>,

    source: Arc<dyn DesiredStateSource>,

    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        agent: Arc<DataplaneAgent>,
        source: Arc<dyn DesiredStateSource>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            agent,
            source,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_interval_secs = self.config.resync_interval.as_secs(),
            pass_timeout_secs = self.config.pass_timeout.as_secs(),
            host_link_interval_secs = self.config.host_link_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut resync_interval = tokio::time::interval(self.config.resync_interval);
        let mut host_link_interval = tokio::time::interval(self.config.host_link_interval);

        loop {
            tokio::select! {
                _ = resync_interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation failed");
                    }
                }
                _ = host_link_interval.tick() => {
                    if let Err(e) = self.agent.interface_configurator().sync_host_links().await {
                        warn!(error = %e, "Host link sync failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    pub async fn reconcile(&self) -> anyhow::Result<ResyncReport> {
        debug!("Starting reconciliation");

        let desired = match self.source.load().await {
            Ok(desired) => desired,
            Err(e) => {
                warn!(error = %e, "Failed to load desired state, skipping pass");
                return Err(e.into());
            }
        };

        let report = tokio::time::timeout(self.config.pass_timeout, self.agent.resync(&desired))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "resync pass exceeded {}s",
                    self.config.pass_timeout.as_secs()
                )
            })?;

        if let Some(e) = report.last_error() {
            warn!(error = %e, "Pass completed with errors");
        }
        Ok(report)
    }
}
