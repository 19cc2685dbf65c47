//! File-backed reference backend.
//!
//! The manifest is a TOML document with the scaler configuration under
//! `[scaler]` and one `[[resources]]` table per resource:
//!
//! ```toml
//! [scaler]
//! namespace = "default"
//!
//! [scaler.autoscaler]
//! scale_interval = "30s"
//!
//! [[resources]]
//! name = "r1"
//!
//! [[resources.scale_resources]]
//! metric_name = "requests"
//! window = "5m"
//! threshold = 0
//! ```
//!
//! The manifest is re-read on every call, so editing it reconfigures a
//! running daemon on the next reconfigure pass. Replica changes are only
//! recorded in memory and succeed immediately.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use zeroscale_state::{
    BackendError, ConfigError, RawScalerConfig, Resource, ResourceScaler, ResourceScalerConfig,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Manifest {
    scaler: RawScalerConfig,
    resources: Vec<Resource>,
}

pub struct FileBackend {
    path: PathBuf,
    replicas: RwLock<HashMap<String, u32>>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            replicas: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last replica count set for `resource`.
    pub async fn replicas(&self, resource: &str) -> Option<u32> {
        self.replicas.read().await.get(resource).copied()
    }

    async fn load(&self) -> Result<Manifest, BackendError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| BackendError::Request(format!("read {}: {e}", self.path.display())))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }
}

#[async_trait]
impl ResourceScaler for FileBackend {
    async fn set_scale(&self, resource: &str, replicas: u32) -> Result<(), BackendError> {
        let manifest = self.load().await?;
        if !manifest.resources.iter().any(|r| r.name == resource) {
            return Err(BackendError::NotFound(resource.to_string()));
        }
        let previous = self
            .replicas
            .write()
            .await
            .insert(resource.to_string(), replicas);
        info!(%resource, replicas, ?previous, "replica count set");
        Ok(())
    }

    async fn get_resources(&self) -> Result<Vec<Resource>, BackendError> {
        let resources = self.load().await?.resources;
        let mut seen = HashSet::new();
        for resource in &resources {
            if resource.name.trim().is_empty() {
                return Err(ConfigError::EmptyResourceName.into());
            }
            if !seen.insert(resource.name.as_str()) {
                return Err(ConfigError::Parse(format!(
                    "resource {} is listed more than once",
                    resource.name
                ))
                .into());
            }
        }
        Ok(resources)
    }

    async fn get_config(&self) -> Result<ResourceScalerConfig, BackendError> {
        Ok(self.load().await?.scaler.validate()?)
    }
}
