//! zeroscaled: the zeroscale daemon.
//!
//! Single binary that assembles every zeroscale component around one
//! resource registry:
//! - Poller (metrics and resource listing)
//! - AutoScaler (scale-to-zero decisions)
//! - DLX proxy (holds and wakes traffic for resources at zero)
//! - Admin API (health, resource table, Prometheus)
//!
//! The reference [`FileBackend`] reads resources and configuration from a
//! TOML manifest, which makes the daemon runnable without an orchestrator.

pub mod admin;
pub mod backend;
pub mod daemon;

pub use backend::FileBackend;
pub use daemon::Daemon;
