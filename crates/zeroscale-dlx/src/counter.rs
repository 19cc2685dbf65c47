//! In-process request counter, usable as a metrics source.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use zeroscale_state::{MetricsError, MetricsSource, Sample, TimeRange};

/// Metric name served by [`RequestCounter`].
pub const REQUESTS_METRIC: &str = "requests";

/// Counts requests the DLX routes to each resource.
///
/// As a [`MetricsSource`] every query drains the count accumulated since
/// the previous query into a single sample at the end of the range.
#[derive(Clone, Default)]
pub struct RequestCounter {
    counts: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
}

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, resource: &str) {
        if let Some(count) = self.counts.read().await.get(resource) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counts
            .write()
            .await
            .entry(resource.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Requests counted since the last drain.
    pub async fn pending(&self, resource: &str) -> u64 {
        self.counts
            .read()
            .await
            .get(resource)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn drain(&self, resource: &str) -> u64 {
        self.counts
            .read()
            .await
            .get(resource)
            .map(|c| c.swap(0, Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[async_trait]
impl MetricsSource for RequestCounter {
    async fn query(
        &self,
        resource: &str,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<Sample>, MetricsError> {
        if metric != REQUESTS_METRIC {
            return Ok(Vec::new());
        }
        let count = self.drain(resource).await;
        Ok(vec![Sample::new(range.end, count as f64)])
    }

    async fn forget(&self, resource: &str) {
        self.counts.write().await.remove(resource);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn query_drains_the_count() {
        let counter = RequestCounter::new();
        for _ in 0..3 {
            counter.increment("r1").await;
        }
        counter.increment("r2").await;
        assert_eq!(counter.pending("r1").await, 3);

        let range = TimeRange::last(Duration::from_secs(30));
        let samples = counter.query("r1", REQUESTS_METRIC, range).await.unwrap();
        assert_eq!(samples, vec![Sample::new(range.end, 3.0)]);

        let samples = counter.query("r1", REQUESTS_METRIC, range).await.unwrap();
        assert_eq!(samples[0].value, 0.0);
        assert_eq!(counter.pending("r2").await, 1);
    }

    #[tokio::test]
    async fn other_metrics_have_no_samples() {
        let counter = RequestCounter::new();
        counter.increment("r1").await;
        let range = TimeRange::last(Duration::from_secs(30));
        assert!(counter.query("r1", "cpu", range).await.unwrap().is_empty());
        assert_eq!(counter.pending("r1").await, 1);
    }

    #[tokio::test]
    async fn forget_drops_the_count() {
        let counter = RequestCounter::new();
        counter.increment("r1").await;
        counter.forget("r1").await;
        assert_eq!(counter.pending("r1").await, 0);

        let range = TimeRange::last(Duration::from_secs(30));
        let samples = counter.query("r1", REQUESTS_METRIC, range).await.unwrap();
        assert_eq!(samples[0].value, 0.0);
    }
}
