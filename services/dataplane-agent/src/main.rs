//! dpsync dataplane agent
//!
//! The agent keeps a packet forwarder's interfaces and BFD configuration
//! converged to a declarative desired state, across agent restarts and
//! out-of-band changes.
//!
//! ## Architecture
//!
//! - **Reconciler**: Loads desired state and runs a resync pass periodically
//! - **Agent**: One resync orchestrator per resource kind
//! - **Persister**: Saves the interface registry so a restart can correlate
//! - **Dataplane**: Abstracts the forwarder API (in-memory forwarder for now)

use std::sync::Arc;

use anyhow::{Context, Result};
use dpsync_agent::agent::DataplaneAgent;
use dpsync_agent::config::Config;
use dpsync_agent::dataplane::MockDataplane;
use dpsync_agent::desired::FileDesiredStateSource;
use dpsync_agent::reconciler::{Reconciler, ReconcilerConfig};
use dpsync_agent::state::SqliteSnapshotStore;
use dpsync_reconcile::Configurator;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dpsync dataplane agent");
    info!(
        agent_label = %config.agent_label,
        data_dir = %config.data_dir.display(),
        desired_state = %config.desired_state_path.display(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = Arc::new(
        SqliteSnapshotStore::open(config.state_db_path())
            .context("failed to open snapshot store")?,
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the dataplane (mock for now)
    let dataplane = Arc::new(MockDataplane::new());

    let agent = Arc::new(DataplaneAgent::new(
        dataplane,
        store,
        config.agent_label.clone(),
    ));

    // Start the interface registry persister
    let persister_handle = tokio::spawn({
        let agent = Arc::clone(&agent);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            let persister = agent.interface_persister();
            persister
                .run(agent.interface_configurator().registry(), shutdown_rx)
                .await;
        }
    });

    // Start the reconciliation loop
    let reconciler = Reconciler::new(
        Arc::clone(&agent),
        Arc::new(FileDesiredStateSource::new(&config.desired_state_path)),
        ReconcilerConfig::from(&config),
    );
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    if let Err(e) = persister_handle.await {
        error!(error = %e, "Persister task panicked");
    }

    info!("Dataplane agent shutdown complete");
    Ok(())
}
