//! Pluggable collaborators: the scaling backend and the metrics source.
//!
//! The core never depends on a concrete orchestrator. Anything that can
//! change replica counts and list resources implements [`ResourceScaler`];
//! anything that can answer windowed metric queries implements
//! [`MetricsSource`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ResourceScalerConfig;
use crate::error::{BackendError, MetricsError};
use crate::types::{Resource, Sample, TimeRange};

/// The backend capability set.
#[async_trait]
pub trait ResourceScaler: Send + Sync {
    /// Set the desired replica count.
    ///
    /// Must be safe to retry and idempotent: asking for the count a resource
    /// already has succeeds. For a non-zero count the call returns once the
    /// resource is ready to serve.
    async fn set_scale(&self, resource: &str, replicas: u32) -> Result<(), BackendError>;

    /// The authoritative resource and rule set.
    async fn get_resources(&self) -> Result<Vec<Resource>, BackendError>;

    /// Startup configuration, read once.
    async fn get_config(&self) -> Result<ResourceScalerConfig, BackendError>;
}

/// Pull-based source of metric samples.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(
        &self,
        resource: &str,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<Sample>, MetricsError>;

    /// Drop anything kept for a resource that no longer exists.
    async fn forget(&self, _resource: &str) {}
}

/// Run one backend call, failing with [`BackendError::Timeout`] once
/// `timeout` passes. The call is dropped at the deadline.
pub async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(BackendError::Timeout(timeout)))
}
