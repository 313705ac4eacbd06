//! Configuration for the dataplane agent.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Dataplane agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Label namespacing this agent's persisted snapshots.
    pub agent_label: String,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Desired-state JSON document.
    pub desired_state_path: PathBuf,

    /// Interval between resync passes in seconds.
    pub resync_interval_secs: u64,

    /// Upper bound for one pass in seconds.
    pub pass_timeout_secs: u64,

    /// Interval between host link polls in seconds.
    pub host_link_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let agent_label = var("DPSYNC_AGENT_LABEL").unwrap_or_else(|| "dpsync-agent".to_string());
        if agent_label.is_empty() {
            anyhow::bail!("DPSYNC_AGENT_LABEL must not be empty");
        }

        let data_dir = PathBuf::from(
            var("DPSYNC_DATA_DIR").unwrap_or_else(|| "/var/lib/dpsync".to_string()),
        );

        let desired_state_path = var("DPSYNC_DESIRED_STATE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("desired.json"));

        let resync_interval_secs = parse_secs(&var, "DPSYNC_RESYNC_INTERVAL", 30)?;
        let pass_timeout_secs = parse_secs(&var, "DPSYNC_PASS_TIMEOUT", 60)?;
        let host_link_interval_secs = parse_secs(&var, "DPSYNC_HOST_LINK_INTERVAL", 5)?;

        let log_level = var("DPSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            agent_label,
            data_dir,
            desired_state_path,
            resync_interval_secs,
            pass_timeout_secs,
            host_link_interval_secs,
            log_level,
        })
    }

    /// Path of the SQLite snapshot database.
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }
}

fn parse_secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    let secs = match var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number of seconds, got {raw:?}"))?,
        None => default,
    };
    if secs == 0 {
        anyhow::bail!("{key} must be positive");
    }
    Ok(secs)
}
