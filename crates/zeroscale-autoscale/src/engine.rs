//! AutoScaler engine: windowed scale-to-zero decisions.
//!
//! On every tick each resource is evaluated in its own task, so resources
//! progress in parallel. Decisions and transitions happen under the slot
//! lock. The scale-down backend call does not: the engine claims it under
//! the lock, makes the call unlocked, then re-locks and settles only if no
//! transition happened in between. Traffic arriving meanwhile is therefore
//! never queued behind the backend. Waking is delegated to the
//! [`Activator`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use zeroscale_metrics::MetricStore;
use zeroscale_state::{
    AutoScalerOptions, Registry, ResourceRecord, ResourceScaler, ResourceSlot, ScaleError,
    ScaleState, bounded, duration_millis,
};

use crate::activator::Activator;

/// Replica count requested when a cancelled scale-down already went through.
const RESTORE_REPLICAS: u32 = 1;

/// What to do after the locked part of an evaluation.
enum Step {
    Done(TickOutcome),
    /// Make the scale-down call claimed at `claimed_at`.
    ScaleDown { claimed_at: Instant },
}

/// What a tick did to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    /// Scale-down succeeded.
    ScaledToZero,
    /// Scale-down failed; will retry next tick.
    ScaleDownFailed { attempts: u32 },
    /// Scale-down failed too often; back to `scaledFromZero`, degraded.
    ScaleDownAbandoned,
    /// Traffic cancelled the scale-down while the backend call was running.
    ScaleDownCancelled,
    /// Demand observed on a `non` resource; scale-from-zero started.
    Woken,
    /// A scale-from-zero episode overran its deadline.
    ReadinessTimedOut,
}

#[derive(Clone)]
pub struct AutoScaler {
    registry: Registry,
    store: MetricStore,
    backend: Arc<dyn ResourceScaler>,
    activator: Activator,
    options: AutoScalerOptions,
}

impl AutoScaler {
    pub fn new(
        registry: Registry,
        store: MetricStore,
        backend: Arc<dyn ResourceScaler>,
        activator: Activator,
        options: AutoScalerOptions,
    ) -> Self {
        Self {
            registry,
            store,
            backend,
            activator,
            options,
        }
    }

    /// Evaluate every resource once. Results are sorted by resource name.
    pub async fn tick(&self) -> Vec<(String, TickOutcome)> {
        let mut tasks = JoinSet::new();
        for (name, slot) in self.registry.slots().await {
            let this = self.clone();
            tasks.spawn(async move {
                let outcome = this.evaluate(&name, &slot).await;
                (name, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => error!(error = %e, "resource evaluation task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Evaluate one resource.
    pub async fn evaluate(&self, name: &str, slot: &ResourceSlot) -> TickOutcome {
        let step = {
            let mut record = slot.lock().await;
            self.step(&mut record).await
        };
        let result = match step {
            Ok(Step::Done(outcome)) => Ok(outcome),
            Ok(Step::ScaleDown { claimed_at }) => self.scale_down(name, slot, claimed_at).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(resource = %name, error = %e, "autoscaler step failed");
                TickOutcome::Unchanged
            }
        }
    }

    async fn step(&self, record: &mut ResourceRecord) -> Result<Step, ScaleError> {
        match record.state() {
            ScaleState::ScaledFromZero => {
                if !self.all_idle(record).await {
                    return Ok(Step::Done(TickOutcome::Unchanged));
                }
                record.transition(ScaleState::ScalingToZero)?;
                Ok(self.claim_scale_down(record))
            }
            ScaleState::ScalingToZero => Ok(self.claim_scale_down(record)),
            ScaleState::Non => {
                if !self.any_demand(record).await {
                    return Ok(Step::Done(TickOutcome::Unchanged));
                }
                self.activator.wake(record)?;
                Ok(Step::Done(TickOutcome::Woken))
            }
            ScaleState::ScalingFromZero => {
                if record.since_transition() < self.options.readiness_timeout {
                    return Ok(Step::Done(TickOutcome::Unchanged));
                }
                warn!(resource = %record.name(), "scale-from-zero overran readiness timeout");
                record.transition(ScaleState::Non)?;
                Ok(Step::Done(TickOutcome::ReadinessTimedOut))
            }
            ScaleState::ScaledToZero => Ok(Step::Done(TickOutcome::Unchanged)),
        }
    }

    fn claim_scale_down(&self, record: &mut ResourceRecord) -> Step {
        if !record.begin_scale_down(self.options.backend_timeout) {
            debug!(resource = %record.name(), "scale-down already in flight");
            return Step::Done(TickOutcome::Unchanged);
        }
        Step::ScaleDown {
            claimed_at: record.transitioned_at(),
        }
    }

    /// Every rule idle over a fully observed window.
    async fn all_idle(&self, record: &ResourceRecord) -> bool {
        let rules = record.scale_resources();
        if rules.is_empty() {
            return false;
        }
        let since = record.since_transition();
        for rule in rules {
            if since < rule.window {
                debug!(resource = %record.name(), metric = %rule.metric_name, "window not yet observed");
                return false;
            }
            let value = self.store.evaluate(record.name(), rule).await;
            if !rule.is_idle(value) {
                debug!(
                    resource = %record.name(),
                    metric = %rule.metric_name,
                    value,
                    threshold = rule.threshold,
                    "still active"
                );
                return false;
            }
        }
        true
    }

    async fn any_demand(&self, record: &ResourceRecord) -> bool {
        for rule in record.scale_resources() {
            let value = self.store.evaluate(record.name(), rule).await;
            if rule.shows_demand(value) {
                debug!(
                    resource = %record.name(),
                    metric = %rule.metric_name,
                    value,
                    threshold = rule.threshold,
                    "demand observed"
                );
                return true;
            }
        }
        false
    }

    /// Make the claimed scale-down call without the slot lock, then settle.
    async fn scale_down(
        &self,
        name: &str,
        slot: &ResourceSlot,
        claimed_at: Instant,
    ) -> Result<TickOutcome, ScaleError> {
        let timeout = self.options.backend_timeout;
        let result = bounded(timeout, self.backend.set_scale(name, 0)).await;

        let mut record = slot.lock().await;
        record.end_scale_down();
        if record.state() != ScaleState::ScalingToZero || record.transitioned_at() != claimed_at {
            drop(record);
            return Ok(self.cancelled_scale_down(name, slot, result.is_ok()).await);
        }

        match result {
            Ok(()) => {
                record.transition(ScaleState::ScaledToZero)?;
                record.clear_degraded();
                Ok(TickOutcome::ScaledToZero)
            }
            Err(e) => {
                let attempts = record.record_scale_down_failure();
                let max = self.options.max_scale_down_attempts;
                warn!(resource = %name, attempts, max, error = %e, "scale to zero failed");
                if attempts < max {
                    return Ok(TickOutcome::ScaleDownFailed { attempts });
                }
                record.transition(ScaleState::ScaledFromZero)?;
                record.mark_degraded(format!("scale to zero failed {attempts} times: {e}"));
                Ok(TickOutcome::ScaleDownAbandoned)
            }
        }
    }

    /// Traffic took the resource back while the scale-down call ran. If
    /// the backend already removed the replicas, ask for one again.
    async fn cancelled_scale_down(
        &self,
        name: &str,
        slot: &ResourceSlot,
        scaled_down: bool,
    ) -> TickOutcome {
        info!(resource = %name, "scale-down cancelled by traffic");
        if scaled_down {
            let timeout = self.options.backend_timeout;
            if let Err(e) = bounded(timeout, self.backend.set_scale(name, RESTORE_REPLICAS)).await {
                warn!(resource = %name, error = %e, "failed to restore replicas after cancelled scale-down");
                slot.lock()
                    .await
                    .mark_degraded(format!("replicas not restored after cancelled scale-down: {e}"));
            }
        }
        TickOutcome::ScaleDownCancelled
    }

    /// Run the tick loop until shutdown. An in-flight tick is allowed to
    /// finish; its backend calls are bounded by `backend_timeout`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = duration_millis(self.options.scale_interval),
            namespace = %self.options.namespace,
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.options.scale_interval) => {
                    let outcomes = self.tick().await;
                    let changed = outcomes
                        .iter()
                        .filter(|(_, o)| *o != TickOutcome::Unchanged)
                        .count();
                    debug!(resources = outcomes.len(), changed, "autoscaler tick complete");
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
