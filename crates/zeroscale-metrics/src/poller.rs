//! Poller: feeds the metric store and keeps the registry in sync with the
//! backend.
//!
//! Two independent loops:
//! - every `metric_interval`, query the metrics source for every declared
//!   metric of every resource (one task per query, each bounded by
//!   `query_timeout`) and record the samples;
//! - every `reconfigure_interval`, list resources from the backend (each
//!   attempt bounded by `backend_timeout`) and reconcile the registry,
//!   dropping metric history of removed resources.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use zeroscale_state::{
    Backoff, BackendError, MetricsError, MetricsSource, PollerOptions, ReconcileStats, Registry,
    ResourceScaler, TimeRange, bounded, duration_millis,
};

use crate::store::MetricStore;

/// Result of one metrics pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    pub queries: usize,
    pub samples: usize,
    pub failures: usize,
}

pub struct Poller {
    registry: Registry,
    store: MetricStore,
    backend: Arc<dyn ResourceScaler>,
    source: Arc<dyn MetricsSource>,
    options: PollerOptions,
    backoff: Backoff,
}

impl Poller {
    pub fn new(
        registry: Registry,
        store: MetricStore,
        backend: Arc<dyn ResourceScaler>,
        source: Arc<dyn MetricsSource>,
        options: PollerOptions,
    ) -> Self {
        Self {
            registry,
            store,
            backend,
            source,
            options,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Pull one interval's worth of samples for every (resource, metric).
    pub async fn poll_metrics(&self) -> PollStats {
        let range = TimeRange::last(self.options.metric_interval);
        let mut queries = JoinSet::new();

        for (name, slot) in self.registry.slots().await {
            let metrics: BTreeSet<String> = slot
                .lock()
                .await
                .scale_resources()
                .iter()
                .map(|r| r.metric_name.clone())
                .collect();

            for metric in metrics {
                let source = Arc::clone(&self.source);
                let store = self.store.clone();
                let registry = self.registry.clone();
                let slot = Arc::clone(&slot);
                let resource = name.clone();
                let timeout = self.options.query_timeout;

                queries.spawn(async move {
                    let samples = tokio::time::timeout(timeout, source.query(&resource, &metric, range))
                        .await
                        .unwrap_or(Err(MetricsError::Timeout(timeout)));
                    match samples {
                        Ok(samples) => {
                            // Recording under the slot lock orders this
                            // against `Registry::remove`, so samples for a
                            // removed resource never land after its history
                            // is dropped.
                            let _record = slot.lock().await;
                            if !registry.holds(&resource, &slot).await {
                                debug!(%resource, %metric, "resource removed during query, dropping samples");
                                return Ok(0);
                            }
                            let n = samples.len();
                            store.record_many(&resource, &metric, samples).await;
                            Ok(n)
                        }
                        Err(e) => {
                            warn!(%resource, %metric, error = %e, "metrics query failed");
                            Err(e)
                        }
                    }
                });
            }
        }

        let mut stats = PollStats::default();
        while let Some(joined) = queries.join_next().await {
            stats.queries += 1;
            match joined {
                Ok(Ok(n)) => stats.samples += n,
                Ok(Err(_)) => stats.failures += 1,
                Err(e) => {
                    error!(error = %e, "metrics query task panicked");
                    stats.failures += 1;
                }
            }
        }

        debug!(
            queries = stats.queries,
            samples = stats.samples,
            failures = stats.failures,
            "metrics poll complete"
        );
        stats
    }

    /// List resources from the backend and reconcile the registry.
    pub async fn reconfigure(&self) -> Result<ReconcileStats, BackendError> {
        let backend = &self.backend;
        let timeout = self.options.backend_timeout;
        let resources = self
            .backoff
            .retry("get_resources", move || bounded(timeout, backend.get_resources()))
            .await?;

        let stats = self.registry.reconcile(resources).await;
        for name in &stats.removed {
            self.store.forget(name).await;
            self.source.forget(name).await;
        }

        if !stats.added.is_empty() || !stats.removed.is_empty() || !stats.updated.is_empty() {
            info!(
                added = stats.added.len(),
                updated = stats.updated.len(),
                removed = stats.removed.len(),
                "resources reconciled"
            );
        }
        Ok(stats)
    }

    /// Run both loops until shutdown. Reconfigures once before the first
    /// metrics pass so the registry is populated. A pass still in flight
    /// when shutdown arrives is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            metric_interval_ms = duration_millis(self.options.metric_interval),
            reconfigure_interval_ms = duration_millis(self.options.reconfigure_interval),
            namespace = %self.options.namespace,
            "poller started"
        );

        tokio::select! {
            result = self.reconfigure() => {
                if let Err(e) = result {
                    error!(error = %e, "initial resource listing failed");
                }
            }
            _ = shutdown.changed() => {
                info!("poller shutting down");
                return;
            }
        }

        let metrics = {
            let this = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(this.options.metric_interval) => {
                            tokio::select! {
                                _ = this.poll_metrics() => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let reconfigure = {
            let this = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(this.options.reconfigure_interval) => {
                            tokio::select! {
                                result = this.reconfigure() => {
                                    if let Err(e) = result {
                                        error!(error = %e, "resource listing failed");
                                    }
                                }
                                _ = shutdown.changed() => break,
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let _ = metrics.await;
        let _ = reconfigure.await;
        info!("poller shutting down");
    }
}
