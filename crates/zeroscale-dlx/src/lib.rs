//! zeroscale-dlx: the proxy in front of scale-to-zero resources.
//!
//! Every request names its target resource and upstream path in two
//! headers. Requests for serving resources are forwarded straight away;
//! requests for a resource at zero wake it through the shared
//! [`Activator`](zeroscale_autoscale::Activator) and are held until it is
//! ready.
//!
//! # Responses
//!
//! | Status | When |
//! |---|---|
//! | upstream's | forwarded |
//! | 400 | identity or path header missing or invalid |
//! | 404 | resource not in the registry |
//! | 502 | upstream unreachable |
//! | 503 + `Retry-After` | too many held requests, or scale-from-zero failed |
//! | 504 | resource not ready within the readiness timeout |

pub mod counter;
pub mod error;
pub mod gate;
pub mod proxy;

pub use counter::{REQUESTS_METRIC, RequestCounter};
pub use error::DlxError;
pub use gate::HoldGate;
pub use proxy::Dlx;
