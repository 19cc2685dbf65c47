//! Error types shared across zeroscale components.

use std::time::Duration;

use thiserror::Error;

use crate::types::ScaleState;

/// Result type alias for configuration parsing.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Malformed configuration. Raised at load/parse time only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("scale resource has an empty metric name")]
    EmptyMetricName,

    #[error("scale resource {metric}: window must be positive")]
    NonPositiveWindow { metric: String },

    #[error("scale resource {metric}: threshold must be non-negative, got {threshold}")]
    NegativeThreshold { metric: String, threshold: i64 },

    #[error("unrecognized scale state: {0:?}")]
    UnknownState(String),

    #[error("invalid duration {value:?} for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("{0} must be positive")]
    ZeroValue(String),

    #[error("{field} must equal {other}")]
    Mismatch { field: String, other: String },

    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("resource has an empty name")]
    EmptyResourceName,

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Failure reported by (or while talking to) the scaling backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure from the external metrics source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    #[error("metrics query failed: {0}")]
    Query(String),

    #[error("metrics query timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures of the scale-state machine and of scale-from-zero episodes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    #[error("resource {resource} did not become ready within {timeout:?}")]
    ReadinessTimeout { resource: String, timeout: Duration },

    #[error("resource {resource}: illegal transition {from} -> {to}")]
    IllegalTransition {
        resource: String,
        from: ScaleState,
        to: ScaleState,
    },

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("resource {resource} failed to scale from zero: {reason}")]
    ActivationFailed { resource: String, reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}
