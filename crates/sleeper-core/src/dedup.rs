//! Short-lived memory of completed item ids.
//!
//! A redelivered item whose id is still remembered is acknowledged without
//! running its work again. Entries lapse after the configured TTL, so the
//! cache narrows duplicate processing but cannot rule it out.

use queue_runtime::MessageId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
#[path = "dedup_tests.rs"]
mod tests;

/// Completed item ids with their expiry deadlines, shared by a worker pool
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    completed: Mutex<HashMap<MessageId, Instant>>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            completed: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MessageId, Instant>> {
        self.completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember that the work for `id` completed
    pub fn record(&self, id: &MessageId) {
        let now = Instant::now();
        let mut completed = self.lock();
        completed.retain(|_, expires_at| *expires_at > now);
        completed.insert(id.clone(), now + self.ttl);
    }

    /// Whether the work for `id` completed within the TTL
    pub fn contains(&self, id: &MessageId) -> bool {
        let now = Instant::now();
        self.lock()
            .get(id)
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false)
    }

    /// Number of ids still remembered
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|at| **at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
