//! Metric store: per-resource, per-metric sliding windows of samples.
//!
//! Retention is bounded by the windows the store is asked about: each series
//! keeps samples as far back as the largest window it has been aggregated
//! over (or `default_retention` until the first aggregate), and evicts older
//! samples on every write and read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tracing::debug;

use zeroscale_state::{Reducer, Sample, ScaleResource};

/// Samples for one (resource, metric) pair.
struct Series {
    samples: Vec<Sample>,
    retention: Duration,
}

impl Series {
    fn new(retention: Duration) -> Self {
        Self {
            samples: Vec::new(),
            retention,
        }
    }

    fn evict(&mut self, now: SystemTime) {
        if let Some(cutoff) = now.checked_sub(self.retention) {
            self.samples.retain(|s| s.timestamp >= cutoff);
        }
    }
}

/// Sliding-window storage shared by the poller (writer) and the autoscaler
/// (reader). Cheap to clone.
#[derive(Clone)]
pub struct MetricStore {
    /// resource → metric → series.
    series: Arc<RwLock<HashMap<String, HashMap<String, Series>>>>,
    default_retention: Duration,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl MetricStore {
    pub fn new(default_retention: Duration) -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
            default_retention,
        }
    }

    /// Append one sample.
    pub async fn record(&self, resource: &str, metric: &str, timestamp: SystemTime, value: f64) {
        self.record_many(resource, metric, [Sample::new(timestamp, value)])
            .await;
    }

    /// Append a batch of samples.
    pub async fn record_many(
        &self,
        resource: &str,
        metric: &str,
        samples: impl IntoIterator<Item = Sample>,
    ) {
        let mut series = self.series.write().await;
        let s = series
            .entry(resource.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_insert_with(|| Series::new(self.default_retention));
        s.samples.extend(samples);
        s.evict(SystemTime::now());
    }

    /// Sum of the samples in `[now - window, now]`.
    pub async fn aggregate(&self, resource: &str, metric: &str, window: Duration) -> f64 {
        self.reduce_at(resource, metric, window, Reducer::Sum, SystemTime::now())
            .await
    }

    /// The rule's reducer over the rule's window, ending now.
    pub async fn evaluate(&self, resource: &str, rule: &ScaleResource) -> f64 {
        self.reduce_at(
            resource,
            &rule.metric_name,
            rule.window,
            rule.reducer,
            SystemTime::now(),
        )
        .await
    }

    /// Reduce the samples in `[now - window, now]`. Unknown series reduce
    /// to 0.
    pub async fn reduce_at(
        &self,
        resource: &str,
        metric: &str,
        window: Duration,
        reducer: Reducer,
        now: SystemTime,
    ) -> f64 {
        let mut series = self.series.write().await;
        let Some(s) = series.get_mut(resource).and_then(|m| m.get_mut(metric)) else {
            return 0.0;
        };

        s.retention = s.retention.max(window);
        s.evict(now);

        let start = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
        reducer.apply(
            s.samples
                .iter()
                .filter(|x| x.timestamp >= start && x.timestamp <= now)
                .map(|x| x.value),
        )
    }

    /// Drop all history for a resource.
    pub async fn forget(&self, resource: &str) {
        if self.series.write().await.remove(resource).is_some() {
            debug!(%resource, "metric history dropped");
        }
    }

    /// Number of retained samples for a series.
    pub async fn sample_count(&self, resource: &str, metric: &str) -> usize {
        self.series
            .read()
            .await
            .get(resource)
            .and_then(|m| m.get(metric))
            .map(|s| s.samples.len())
            .unwrap_or(0)
    }

    /// Resources with any retained history.
    pub async fn tracked_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ago(secs: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn missing_series_aggregates_to_zero() {
        let store = MetricStore::default();
        assert_eq!(store.aggregate("r1", "requests", Duration::from_secs(60)).await, 0.0);
    }

    #[tokio::test]
    async fn aggregate_sums_samples_inside_window() {
        let store = MetricStore::default();
        store.record("r1", "requests", ago(10), 3.0).await;
        store.record("r1", "requests", ago(20), 4.0).await;
        store.record("r1", "requests", ago(120), 100.0).await;

        let sum = store.aggregate("r1", "requests", Duration::from_secs(60)).await;
        assert_eq!(sum, 7.0);

        let wide = store.aggregate("r1", "requests", Duration::from_secs(300)).await;
        assert_eq!(wide, 107.0);
    }

    #[tokio::test]
    async fn future_samples_are_ignored() {
        let store = MetricStore::default();
        let now = SystemTime::now();
        store.record("r1", "m", now + Duration::from_secs(30), 9.0).await;
        store.record("r1", "m", now - Duration::from_secs(1), 1.0).await;

        let v = store
            .reduce_at("r1", "m", Duration::from_secs(60), Reducer::Sum, now)
            .await;
        assert_eq!(v, 1.0);
    }

    #[tokio::test]
    async fn evaluate_uses_rule_reducer() {
        let store = MetricStore::default();
        store.record("r1", "cpu", ago(5), 10.0).await;
        store.record("r1", "cpu", ago(6), 30.0).await;

        let rule = ScaleResource::new("cpu", Duration::from_secs(60), 20)
            .unwrap()
            .with_reducer(Reducer::Average);
        assert_eq!(store.evaluate("r1", &rule).await, 20.0);
    }

    #[tokio::test]
    async fn retention_follows_largest_window() {
        let store = MetricStore::new(Duration::from_secs(60));
        store.record("r1", "requests", ago(10), 1.0).await;
        // Widen retention to 10 minutes.
        store.aggregate("r1", "requests", Duration::from_secs(600)).await;

        store.record("r1", "requests", ago(300), 1.0).await;
        store.record("r1", "requests", ago(900), 1.0).await;

        // The 15-minute-old sample is beyond retention and gets evicted.
        assert_eq!(store.sample_count("r1", "requests").await, 2);
    }

    #[tokio::test]
    async fn forget_drops_history() {
        let store = MetricStore::default();
        store.record("r1", "requests", ago(1), 5.0).await;
        store.record("r2", "requests", ago(1), 5.0).await;

        store.forget("r1").await;

        assert_eq!(store.aggregate("r1", "requests", Duration::from_secs(60)).await, 0.0);
        assert_eq!(store.aggregate("r2", "requests", Duration::from_secs(60)).await, 5.0);
        assert_eq!(store.tracked_resources().await, vec!["r2"]);
    }
}
