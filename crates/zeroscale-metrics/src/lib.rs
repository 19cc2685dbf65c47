//! zeroscale-metrics: demand signals for the autoscaler.
//!
//! Keeps a sliding window of samples per resource and metric, pulls those
//! samples from the external metrics source, keeps the registry in step with
//! the backend's resource list, and renders scale states for Prometheus.
//!
//! # Architecture
//!
//! ```text
//! Poller
//!   ├── poll_metrics()  ← every metric_interval: MetricsSource → MetricStore
//!   ├── reconfigure()   ← every reconfigure_interval: backend → Registry
//!   └── run()           → both loops until shutdown
//!
//! MetricStore
//!   ├── record()        ← poller
//!   └── aggregate()     → autoscaler engine
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod poller;
pub mod prometheus;
pub mod store;

pub use poller::{PollStats, Poller};
pub use prometheus::render_prometheus;
pub use store::MetricStore;
