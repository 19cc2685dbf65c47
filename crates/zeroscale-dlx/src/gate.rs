//! Per-resource cap on held requests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Hands out at most `capacity` hold permits per resource. A request that
/// cannot get one is rejected right away instead of queueing.
#[derive(Clone)]
pub struct HoldGate {
    capacity: usize,
    permits: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl HoldGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim a hold slot; `None` when the resource is at capacity.
    pub async fn try_hold(&self, resource: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut permits = self.permits.lock().await;
            Arc::clone(
                permits
                    .entry(resource.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.capacity))),
            )
        };
        semaphore.try_acquire_owned().ok()
    }

    /// Drop the entry of a removed resource. Outstanding permits stay valid.
    pub async fn forget(&self, resource: &str) {
        self.permits.lock().await.remove(resource);
    }

    /// Requests currently held for `resource`.
    pub async fn held(&self, resource: &str) -> usize {
        let permits = self.permits.lock().await;
        permits
            .get(resource)
            .map(|s| self.capacity - s.available_permits())
            .unwrap_or(0)
    }
}
