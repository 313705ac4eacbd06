//! Desired-state sources.
//!
//! The agent pulls the complete desired state before every pass; change
//! notification from an upstream store is not modelled here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::{BfdAuthKey, BfdEchoFunction, BfdSession, Interface};

/// Errors loading desired state.
#[derive(Debug, Error)]
pub enum DesiredStateError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Complete desired state of one forwarder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub interfaces: Vec<Interface>,

    #[serde(default)]
    pub bfd_sessions: Vec<BfdSession>,

    #[serde(default)]
    pub bfd_keys: Vec<BfdAuthKey>,

    #[serde(default)]
    pub bfd_echo: Vec<BfdEchoFunction>,
}

impl DesiredState {
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
            && self.bfd_sessions.is_empty()
            && self.bfd_keys.is_empty()
            && self.bfd_echo.is_empty()
    }
}

/// Where the agent reads its desired state from.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn load(&self) -> Result<DesiredState, DesiredStateError>;
}

/// Reads desired state from a JSON document on disk.
pub struct FileDesiredStateSource {
    path: PathBuf,
}

impl FileDesiredStateSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DesiredStateSource for FileDesiredStateSource {
    async fn load(&self) -> Result<DesiredState, DesiredStateError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| DesiredStateError::Io {
                path: self.path.clone(),
                source,
            })?;
        let state: DesiredState =
            serde_json::from_slice(&raw).map_err(|source| DesiredStateError::Parse {
                path: self.path.clone(),
                source,
            })?;

        debug!(
            path = %self.path.display(),
            interfaces = state.interfaces.len(),
            bfd_sessions = state.bfd_sessions.len(),
            bfd_keys = state.bfd_keys.len(),
            "Desired state loaded"
        );
        Ok(state)
    }
}

/// In-memory desired state, replaceable at runtime.
#[derive(Default)]
pub struct StaticDesiredStateSource {
    state: RwLock<DesiredState>,
}

impl StaticDesiredStateSource {
    pub fn new(state: DesiredState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn set(&self, state: DesiredState) {
        *self.state.write() = state;
    }
}

#[async_trait]
impl DesiredStateSource for StaticDesiredStateSource {
    async fn load(&self) -> Result<DesiredState, DesiredStateError> {
        Ok(self.state.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InterfaceType;

    #[tokio::test]
    async fn test_file_source_parses_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desired.json");
        std::fs::write(
            &path,
            r#"{
                "interfaces": [
                    { "name": "tap0", "type": "tap", "tap": { "host_if_name": "vpp-tap0" },
                      "ip_addresses": ["10.0.0.1/24"] },
                    { "name": "GigabitEthernet0/8/0", "type": "ethernet_csmacd" }
                ],
                "bfd_keys": [
                    { "name": "k1", "id": 1, "authentication_type": "keyed_sha1", "secret": "secret" }
                ]
            }"#,
        )
        .unwrap();

        let state = FileDesiredStateSource::new(&path).load().await.unwrap();
        assert_eq!(state.interfaces.len(), 2);
        assert_eq!(state.interfaces[1].kind, InterfaceType::EthernetCsmacd);
        assert_eq!(state.bfd_keys[0].id, 1);
        assert!(state.bfd_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_file_source_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = FileDesiredStateSource::new(dir.path().join("missing.json"));
        assert!(matches!(
            missing.load().await,
            Err(DesiredStateError::Io { .. })
        ));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FileDesiredStateSource::new(&path).load().await,
            Err(DesiredStateError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_static_source_replace() {
        let source = StaticDesiredStateSource::default();
        assert!(source.load().await.unwrap().is_empty());

        source.set(DesiredState {
            interfaces: vec![Interface::new("lo1", InterfaceType::SoftwareLoopback)],
            ..Default::default()
        });
        assert_eq!(source.load().await.unwrap().interfaces.len(), 1);
    }
}
