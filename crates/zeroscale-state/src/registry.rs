//! The shared resource table.
//!
//! The `Registry` is the only mutable state shared between the poller, the
//! autoscaler engine and the DLX proxy. Each resource lives in its own
//! [`ResourceSlot`] (`Arc<Mutex<ResourceRecord>>`), so work on one resource
//! is serialized while different resources progress independently. The map
//! lock is only held long enough to look a slot up.
//!
//! Every record owns a readiness `watch` channel. Transitions publish on it,
//! which is what held requests wait on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::duration_millis;
use crate::error::ScaleError;
use crate::types::{Outcome, Readiness, Resource, ResourceSnapshot, ScaleResource, ScaleState};

/// Handle to one resource's record.
pub type ResourceSlot = Arc<Mutex<ResourceRecord>>;

/// A resource plus its lifecycle state.
#[derive(Debug)]
pub struct ResourceRecord {
    name: String,
    scale_resources: Vec<ScaleResource>,
    state: ScaleState,
    transitioned_at: Instant,
    episode: u64,
    degraded: Option<String>,
    scale_down_failures: u32,
    scale_down_started: Option<Instant>,
    readiness: watch::Sender<Readiness>,
}

impl ResourceRecord {
    /// A freshly observed resource, in state `non`.
    pub fn new(resource: Resource) -> Self {
        let (readiness, _) = watch::channel(Readiness {
            episode: 0,
            outcome: Outcome::Ready,
        });
        Self {
            name: resource.name,
            scale_resources: resource.scale_resources,
            state: ScaleState::Non,
            transitioned_at: Instant::now(),
            episode: 0,
            degraded: None,
            scale_down_failures: 0,
            scale_down_started: None,
            readiness,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scale_resources(&self) -> &[ScaleResource] {
        &self.scale_resources
    }

    pub fn state(&self) -> ScaleState {
        self.state
    }

    pub fn transitioned_at(&self) -> Instant {
        self.transitioned_at
    }

    pub fn since_transition(&self) -> Duration {
        self.transitioned_at.elapsed()
    }

    /// Number of scale-from-zero episodes started so far.
    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn degraded(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn mark_degraded(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(resource = %self.name, %reason, "resource degraded");
        self.degraded = Some(reason);
    }

    pub fn clear_degraded(&mut self) {
        if self.degraded.take().is_some() {
            info!(resource = %self.name, "resource recovered");
        }
    }

    /// Count a failed scale-down attempt, returning the running total.
    pub fn record_scale_down_failure(&mut self) -> u32 {
        self.scale_down_failures += 1;
        self.scale_down_failures
    }

    pub fn scale_down_failures(&self) -> u32 {
        self.scale_down_failures
    }

    /// Claim the right to make the scale-down backend call, which runs
    /// without the slot lock. Fails while another claim younger than
    /// `expires_after` is outstanding.
    pub fn begin_scale_down(&mut self, expires_after: Duration) -> bool {
        if self
            .scale_down_started
            .is_some_and(|started| started.elapsed() < expires_after)
        {
            return false;
        }
        self.scale_down_started = Some(Instant::now());
        true
    }

    pub fn end_scale_down(&mut self) {
        self.scale_down_started = None;
    }

    /// Replace the rule set without touching the lifecycle state.
    pub fn set_scale_resources(&mut self, rules: Vec<ScaleResource>) -> bool {
        if self.scale_resources == rules {
            return false;
        }
        self.scale_resources = rules;
        true
    }

    /// Receive readiness updates.
    pub fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    /// Move to `to` if the lifecycle graph allows it.
    ///
    /// Entering `scalingFromZero` starts a new episode. Leaving it publishes
    /// `Ready` (on `scaledFromZero`) or `TimedOut` (on `non`).
    pub fn transition(&mut self, to: ScaleState) -> Result<(), ScaleError> {
        let outcome = match (self.state, to) {
            (ScaleState::ScalingFromZero, ScaleState::ScaledFromZero) => Some(Outcome::Ready),
            (ScaleState::ScalingFromZero, ScaleState::Non) => Some(Outcome::TimedOut),
            (_, ScaleState::ScalingFromZero) => Some(Outcome::Pending),
            _ => None,
        };
        self.apply(to, outcome)
    }

    /// Abandon the current scale-from-zero episode because the backend
    /// failed, reverting to `non`.
    pub fn fail_activation(&mut self, reason: impl Into<String>) -> Result<(), ScaleError> {
        self.apply(ScaleState::Non, Some(Outcome::Failed))?;
        self.mark_degraded(reason);
        Ok(())
    }

    fn apply(&mut self, to: ScaleState, outcome: Option<Outcome>) -> Result<(), ScaleError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(ScaleError::IllegalTransition {
                resource: self.name.clone(),
                from,
                to,
            });
        }

        let now = Instant::now();
        self.transitioned_at = if now > self.transitioned_at {
            now
        } else {
            self.transitioned_at + Duration::from_nanos(1)
        };
        self.state = to;

        if to == ScaleState::ScalingFromZero {
            self.episode += 1;
        }
        if to == ScaleState::ScalingToZero {
            self.scale_down_failures = 0;
        }
        if let Some(outcome) = outcome {
            self.readiness.send_replace(Readiness {
                episode: self.episode,
                outcome,
            });
        }

        info!(resource = %self.name, %from, %to, episode = self.episode, "scale state transition");
        Ok(())
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            name: self.name.clone(),
            state: self.state,
            scale_resources: self.scale_resources.clone(),
            since_transition_ms: duration_millis(self.since_transition()),
            episode: self.episode,
            degraded: self.degraded.clone(),
        }
    }
}

/// Wait until episode `episode` of `resource` settles, or `timeout` passes.
///
/// A later episode showing up means ours settled in between; the wait
/// follows the newer episode with whatever time is left.
pub async fn wait_for_readiness(
    mut rx: watch::Receiver<Readiness>,
    resource: &str,
    mut episode: u64,
    timeout: Duration,
) -> Result<(), ScaleError> {
    let deadline = Instant::now() + timeout;
    let timed_out = || ScaleError::ReadinessTimeout {
        resource: resource.to_string(),
        timeout,
    };

    loop {
        let seen = tokio::time::timeout_at(
            deadline,
            rx.wait_for(|r| r.episode != episode || r.outcome != Outcome::Pending),
        )
        .await
        .map_err(|_| timed_out())?
        .map(|r| *r)
        .map_err(|_| ScaleError::UnknownResource(resource.to_string()))?;

        if seen.episode != episode {
            debug!(resource, from = episode, to = seen.episode, "readiness moved to a newer episode");
            episode = seen.episode;
            if seen.outcome == Outcome::Pending {
                continue;
            }
        }

        return match seen.outcome {
            Outcome::Ready => Ok(()),
            Outcome::TimedOut => Err(timed_out()),
            Outcome::Failed => Err(ScaleError::ActivationFailed {
                resource: resource.to_string(),
                reason: "backend failed to scale from zero".to_string(),
            }),
            Outcome::Pending => continue,
        };
    }
}

/// Summary of a reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

/// The shared resource table. Cheap to clone.
#[derive(Clone, Default)]
pub struct Registry {
    resources: Arc<RwLock<HashMap<String, ResourceSlot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<ResourceSlot> {
        self.resources.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.resources.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }

    /// All resource names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// All slots, sorted by name.
    pub async fn slots(&self) -> Vec<(String, ResourceSlot)> {
        let mut slots: Vec<(String, ResourceSlot)> = self
            .resources
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Insert a new resource in state `non`, or refresh the rules of an
    /// existing one. Returns `true` when the resource was new.
    pub async fn upsert(&self, resource: Resource) -> bool {
        if let Some(slot) = self.get(&resource.name).await {
            let mut record = slot.lock().await;
            if record.set_scale_resources(resource.scale_resources) {
                debug!(resource = %record.name(), "scale rules updated");
            }
            return false;
        }

        let mut resources = self.resources.write().await;
        if let Some(slot) = resources.get(&resource.name) {
            // Lost a race with another insert.
            let slot = Arc::clone(slot);
            drop(resources);
            slot.lock().await.set_scale_resources(resource.scale_resources);
            return false;
        }
        info!(resource = %resource.name, rules = resource.scale_resources.len(), "resource added");
        resources.insert(
            resource.name.clone(),
            Arc::new(Mutex::new(ResourceRecord::new(resource))),
        );
        true
    }

    /// Whether `slot` is still the live entry for `name`. False once the
    /// resource was removed, and for a slot of an earlier incarnation.
    pub async fn holds(&self, name: &str, slot: &ResourceSlot) -> bool {
        self.resources
            .read()
            .await
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Unlink a resource, then wait out whoever holds its slot lock. Once
    /// this returns, lock holders that check [`Registry::holds`] see the
    /// removal.
    pub async fn remove(&self, name: &str) -> Option<ResourceSlot> {
        let removed = self.resources.write().await.remove(name);
        if let Some(slot) = &removed {
            drop(slot.lock().await);
            info!(resource = %name, "resource removed");
        }
        removed
    }

    /// Make the table match `resources`: add new ones, refresh rules of
    /// known ones, drop the rest.
    pub async fn reconcile(&self, resources: Vec<Resource>) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let listed: Vec<String> = resources.iter().map(|r| r.name.clone()).collect();

        for resource in resources {
            let name = resource.name.clone();
            match self.get(&name).await {
                Some(slot) => {
                    if slot.lock().await.set_scale_resources(resource.scale_resources) {
                        stats.updated.push(name);
                    }
                }
                None => {
                    if self.upsert(resource).await {
                        stats.added.push(name);
                    }
                }
            }
        }

        for name in self.names().await {
            if !listed.contains(&name) && self.remove(&name).await.is_some() {
                stats.removed.push(name);
            }
        }

        stats
    }

    /// Snapshots of every resource, sorted by name.
    pub async fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let mut out = Vec::new();
        for (_, slot) in self.slots().await {
            out.push(slot.lock().await.snapshot());
        }
        out
    }

    pub async fn snapshot_of(&self, name: &str) -> Option<ResourceSnapshot> {
        let slot = self.get(name).await?;
        let snapshot = slot.lock().await.snapshot();
        Some(snapshot)
    }
}
