//! Worker pool coordination and drain detection.
//!
//! The approximate count alone cannot tell "nothing left" from "everything
//! is leased by a sibling": storage counts may hide leased items and the
//! in-memory transport never counts them. Under [`DrainPolicy::Coordinated`]
//! workers share a [`DrainTracker`]. Every lease attempt bumps the epoch and
//! holds an in-flight slot until the item is settled, and a worker may only
//! declare the queue drained when it sees a zero count bracketed by two
//! identical quiescent snapshots.

use crate::config::{ConfigError, ConsumerConfig, DrainPolicy};
use crate::dedup::DedupCache;
use crate::work::WorkUnit;
use crate::worker::{poison_queue_name, Worker, WorkerError, WorkerExit, WorkerReport};
use queue_runtime::{QueueClient, QueueName};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(test)]
#[path = "drain_tests.rs"]
mod tests;

// ============================================================================
// Drain Tracker
// ============================================================================

/// Point-in-time view of the shared lease state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub in_flight: usize,
    pub epoch: u64,
}

impl TrackerSnapshot {
    pub fn is_quiescent(&self) -> bool {
        self.in_flight == 0
    }
}

/// Lease bookkeeping shared by the workers of one pool
#[derive(Debug, Default)]
pub struct DrainTracker {
    in_flight: AtomicUsize,
    epoch: AtomicU64,
    drained: AtomicBool,
    changed: Notify,
}

impl DrainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lease attempt; the slot is released when the guard drops
    pub fn begin_lease(self: &Arc<Self>) -> LeaseGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        LeaseGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            epoch: self.epoch.load(Ordering::SeqCst),
        }
    }

    /// Mark the queue drained; returns true for the first caller only
    pub fn declare_drained(&self) -> bool {
        let first = !self.drained.swap(true, Ordering::SeqCst);
        self.changed.notify_waiters();
        first
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// Wait until a lease is released, drain is declared or `timeout` passes
    pub async fn wait_for_change(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.changed.notified()).await;
    }
}

/// An in-flight lease slot
#[derive(Debug)]
pub struct LeaseGuard {
    tracker: Arc<DrainTracker>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.tracker.changed.notify_waiters();
    }
}

// ============================================================================
// Reports and Errors
// ============================================================================

/// Aggregate outcome of a drain where every worker finished cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub policy: DrainPolicy,
    pub workers: Vec<WorkerReport>,
    pub elapsed: Duration,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn malformed(&self) -> usize {
        self.workers.iter().map(|w| w.malformed).sum()
    }

    pub fn poison(&self) -> usize {
        self.workers.iter().map(|w| w.poison).sum()
    }

    pub fn leases_lost(&self) -> usize {
        self.workers.iter().map(|w| w.leases_lost).sum()
    }

    pub fn work_failures(&self) -> usize {
        self.workers.iter().map(|w| w.work_failures).sum()
    }

    pub fn duplicates_skipped(&self) -> usize {
        self.workers.iter().map(|w| w.duplicates_skipped).sum()
    }

    pub fn was_cancelled(&self) -> bool {
        self.workers.iter().any(|w| w.exit == WorkerExit::Cancelled)
    }
}

/// One or more workers ended with an error
#[derive(Debug, Error)]
#[error("{} of {} workers failed", .errors.len(), .errors.len() + .reports.len())]
pub struct DrainError {
    pub errors: Vec<WorkerError>,

    /// Reports of the workers that finished cleanly
    pub reports: Vec<WorkerReport>,
}

impl DrainError {
    /// A worker is useful if it finished cleanly or processed at least one item
    pub fn has_useful_worker(&self) -> bool {
        !self.reports.is_empty() || self.errors.iter().any(WorkerError::processed_any)
    }

    pub fn processed(&self) -> usize {
        let clean: usize = self.reports.iter().map(|r| r.processed).sum();
        let failed: usize = self
            .errors
            .iter()
            .filter_map(WorkerError::report)
            .map(|r| r.processed)
            .sum();
        clean + failed
    }
}

// ============================================================================
// Drain Coordinator
// ============================================================================

/// Runs a pool of lease loops until the queue is drained
pub struct DrainCoordinator {
    client: Arc<dyn QueueClient>,
    queue: QueueName,
    config: ConsumerConfig,
    work: Arc<dyn WorkUnit>,
    shutdown: CancellationToken,
}

impl DrainCoordinator {
    /// Create a coordinator for `queue`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the consumer configuration is invalid.
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue: QueueName,
        config: ConsumerConfig,
        work: Arc<dyn WorkUnit>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        poison_queue_name(&queue, &config)?;
        Ok(Self {
            client,
            queue,
            config,
            work,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Token that stops every worker between items when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run `pool_size` workers and wait for all of them to stop
    ///
    /// A failing or panicking worker never aborts its siblings; failures are
    /// collected into the returned [`DrainError`].
    pub async fn drain(&self, pool_size: usize) -> Result<DrainReport, DrainError> {
        let pool_size = pool_size.max(1);
        let started = Instant::now();
        let tracker = Arc::new(DrainTracker::new());
        let dedup = self
            .config
            .dedup_ttl()
            .map(|ttl| Arc::new(DedupCache::new(ttl)));

        info!(
            queue = %self.queue,
            workers = pool_size,
            policy = ?self.config.drain_policy,
            "Going to consume messages"
        );

        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let worker = Worker::new(
                id,
                Arc::clone(&self.client),
                self.queue.clone(),
                self.config.clone(),
                Arc::clone(&self.work),
            )
            .map_err(|source| DrainError {
                errors: vec![WorkerError::Configuration {
                    worker_id: id,
                    source,
                }],
                reports: Vec::new(),
            })?;
            workers.push(
                worker
                    .with_tracker(Arc::clone(&tracker))
                    .with_dedup(dedup.clone())
                    .with_shutdown(self.shutdown.clone()),
            );
        }

        let handles = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run()))
            .collect::<Vec<_>>();

        let mut reports = Vec::with_capacity(pool_size);
        let mut errors = Vec::new();
        for (id, joined) in futures::future::join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(worker_error)) => errors.push(worker_error),
                Err(join_error) => {
                    error!(worker = id, error = %join_error, "Worker task failed");
                    errors.push(WorkerError::Panicked {
                        worker_id: id,
                        message: join_error.to_string(),
                    });
                }
            }
        }

        let elapsed = started.elapsed();
        if errors.is_empty() {
            let report = DrainReport {
                policy: self.config.drain_policy,
                workers: reports,
                elapsed,
            };
            info!(
                queue = %self.queue,
                processed = report.processed(),
                malformed = report.malformed(),
                leases_lost = report.leases_lost(),
                elapsed_ms = elapsed.as_millis() as u64,
                "All tasks are done"
            );
            Ok(report)
        } else {
            error!(
                queue = %self.queue,
                failed = errors.len(),
                healthy = reports.len(),
                "Drain finished with worker failures"
            );
            Err(DrainError { errors, reports })
        }
    }
}
