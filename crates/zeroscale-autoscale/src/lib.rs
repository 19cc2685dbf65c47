//! zeroscale-autoscale: metrics-driven scale-to-zero.
//!
//! The [`AutoScaler`] ticks on a fixed interval, reads windowed aggregates
//! from the metric store and walks every resource through its lifecycle.
//! The [`Activator`] owns scale-from-zero and is shared with the DLX proxy.
//!
//! # Scaling Algorithm
//!
//! ```text
//! scaledFromZero:
//!     if every rule is idle over its full window:
//!         scalingToZero; SetScale(0)
//!             ok   → scaledToZero
//!             fail → retry next tick; after N failures → scaledFromZero (degraded)
//!
//! non:
//!     if any rule shows demand (aggregate > threshold):
//!         scalingFromZero (via Activator)
//!
//! scalingFromZero:
//!     ready before deadline → scaledFromZero
//!     deadline passed       → non (held requests time out)
//!
//! scaledToZero:
//!     rest; only the Activator leaves it
//! ```
//!
//! A rule is idle when `aggregate < threshold`, or `aggregate == 0` for a
//! zero threshold.

pub mod activator;
pub mod engine;

pub use activator::{Activator, Admission};
pub use engine::{AutoScaler, TickOutcome};
