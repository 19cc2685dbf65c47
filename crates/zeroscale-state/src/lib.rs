//! zeroscale-state: shared state and contracts for zeroscale.
//!
//! Holds the domain types (resources, scaling rules, the five-state scale
//! lifecycle), startup configuration, error types, the pluggable backend and
//! metrics-source traits, and the [`Registry`]: the per-resource state table
//! that the autoscaler engine and the DLX proxy both drive.
//!
//! # Architecture
//!
//! ```text
//! Registry ── RwLock<HashMap<name, Arc<Mutex<ResourceRecord>>>>
//!                                        │
//!                                        ├── state + transition timestamp
//!                                        ├── scale rules
//!                                        └── watch::Sender<Readiness>  ← held requests wait here
//! ```
//!
//! The `Registry` is `Clone` + `Send` + `Sync` and is handed to every
//! component at construction.

pub mod backend;
pub mod backoff;
pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use backend::{MetricsSource, ResourceScaler, bounded};
pub use backoff::Backoff;
pub use config::{
    AutoScalerOptions, DEFAULT_NAME_HEADER, DEFAULT_PATH_HEADER, DEFAULT_TARGET_HOST, DlxOptions,
    PollerOptions, RawScaleResource, RawScalerConfig, ResourceScalerConfig, duration_millis,
    format_duration, parse_duration,
};
pub use error::{BackendError, ConfigError, ConfigResult, MetricsError, ScaleError};
pub use registry::{ReconcileStats, Registry, ResourceRecord, ResourceSlot, wait_for_readiness};
pub use types::*;
