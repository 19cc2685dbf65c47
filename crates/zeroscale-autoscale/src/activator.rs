//! Activator: single-flight scale-from-zero.
//!
//! Both the autoscaler engine and the DLX proxy wake resources through the
//! activator while holding the resource's slot lock. Whoever performs the
//! `→ scalingFromZero` transition spawns the one episode task that calls the
//! backend; everyone else who arrives during the episode just subscribes to
//! the readiness channel. Since the transition and the spawn happen under
//! the same lock, a second backend trigger for the same episode cannot
//! happen.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use zeroscale_state::{
    Backoff, Readiness, Registry, ResourceRecord, ResourceScaler, ScaleError, ScaleState, bounded,
    duration_millis,
};

/// Replica count requested when waking a resource.
const WAKE_REPLICAS: u32 = 1;

/// What the caller should do with traffic for a resource.
#[derive(Debug)]
pub enum Admission {
    /// Replicas are serving; forward now.
    Serving,
    /// A scale-from-zero episode is in flight; wait on `readiness`.
    Hold {
        episode: u64,
        readiness: watch::Receiver<Readiness>,
    },
}

#[derive(Clone)]
pub struct Activator {
    registry: Registry,
    backend: Arc<dyn ResourceScaler>,
    readiness_timeout: Duration,
    backend_timeout: Duration,
    backoff: Backoff,
}

impl Activator {
    pub fn new(
        registry: Registry,
        backend: Arc<dyn ResourceScaler>,
        readiness_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            readiness_timeout,
            backend_timeout: readiness_timeout,
            backoff: Backoff::default(),
        }
    }

    /// Bound each scale-from-zero backend attempt. Defaults to the
    /// readiness timeout.
    pub fn with_backend_timeout(mut self, backend_timeout: Duration) -> Self {
        self.backend_timeout = backend_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    /// Decide what to do with an incoming request.
    ///
    /// Traffic for a resource that is being scaled down cancels the
    /// scale-down; traffic for a scaled-to-zero resource wakes it.
    pub fn admit(&self, record: &mut ResourceRecord) -> Result<Admission, ScaleError> {
        match record.state() {
            ScaleState::Non | ScaleState::ScaledFromZero => Ok(Admission::Serving),
            ScaleState::ScalingToZero => {
                info!(resource = %record.name(), "traffic arrived during scale-down, keeping replicas");
                record.transition(ScaleState::ScaledFromZero)?;
                Ok(Admission::Serving)
            }
            ScaleState::ScaledToZero | ScaleState::ScalingFromZero => self.wake(record),
        }
    }

    /// Start a scale-from-zero episode unless one is already running.
    pub fn wake(&self, record: &mut ResourceRecord) -> Result<Admission, ScaleError> {
        match record.state() {
            ScaleState::ScaledFromZero => Ok(Admission::Serving),
            ScaleState::ScalingFromZero => Ok(Admission::Hold {
                episode: record.episode(),
                readiness: record.subscribe(),
            }),
            _ => {
                record.transition(ScaleState::ScalingFromZero)?;
                let episode = record.episode();
                let readiness = record.subscribe();
                self.spawn_episode(record.name().to_string(), episode);
                Ok(Admission::Hold { episode, readiness })
            }
        }
    }

    fn spawn_episode(&self, resource: String, episode: u64) {
        let this = self.clone();
        tokio::spawn(async move { this.run_episode(resource, episode).await });
    }

    async fn run_episode(&self, resource: String, episode: u64) {
        debug!(%resource, episode, "scale-from-zero episode started");

        // The backend call runs in its own task so hitting the readiness
        // deadline below does not cancel it. Each attempt is bounded, so the
        // task always ends.
        let call = {
            let backend = Arc::clone(&self.backend);
            let backoff = self.backoff;
            let timeout = self.backend_timeout;
            let name = resource.clone();
            tokio::spawn(async move {
                let (backend, name) = (&backend, name.as_str());
                backoff
                    .retry("set_scale", move || {
                        bounded(timeout, backend.set_scale(name, WAKE_REPLICAS))
                    })
                    .await
            })
        };
        let result = tokio::time::timeout(self.readiness_timeout, call).await;

        let Some(slot) = self.registry.get(&resource).await else {
            debug!(%resource, episode, "resource removed during scale-from-zero");
            return;
        };
        let mut record = slot.lock().await;
        if record.episode() != episode || record.state() != ScaleState::ScalingFromZero {
            debug!(%resource, episode, state = %record.state(), "scale-from-zero episode already settled");
            return;
        }

        let settled = match result {
            Ok(Ok(Ok(()))) => {
                record.clear_degraded();
                record.transition(ScaleState::ScaledFromZero)
            }
            Ok(Ok(Err(e))) => record.fail_activation(format!("scale from zero failed: {e}")),
            Ok(Err(e)) => record.fail_activation(format!("scale from zero task failed: {e}")),
            Err(_) => {
                warn!(
                    %resource,
                    episode,
                    timeout_ms = duration_millis(self.readiness_timeout),
                    "resource not ready before deadline"
                );
                record.transition(ScaleState::Non)
            }
        };
        if let Err(e) = settled {
            error!(%resource, episode, error = %e, "failed to settle scale-from-zero episode");
        }
    }
}
