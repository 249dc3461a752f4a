//! The lease loop run by each consumer.
//!
//! A worker repeats Poll → Lease → Process → Acknowledge against one queue:
//!
//! - **Poll** reads the approximate count. A zero count triggers the idle
//!   check of the configured [`DrainPolicy`]; anything else moves to Lease.
//! - **Lease** receives one item under the visibility timeout. An empty
//!   receive backs off briefly and polls again.
//! - **Process** runs the [`WorkUnit`], optionally renewing the lease on an
//!   interval while it runs.
//! - **Acknowledge** deletes the item with its receipt. A stale receipt means
//!   the lease was lost; that is counted and the loop continues.
//!
//! Transport failures while polling, leasing or acknowledging end the loop
//! with a [`WorkerError`]. Cancellation is only observed between items.

use crate::config::{ConfigError, ConsumerConfig, DrainPolicy, MalformedPolicy};
use crate::dedup::DedupCache;
use crate::drain::{DrainTracker, TrackerSnapshot};
use crate::work::{WorkContext, WorkError, WorkUnit};
use queue_runtime::{QueueClient, QueueError, QueueName, ReceiptHandle, ReceivedMessage};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

// ============================================================================
// Reports and Errors
// ============================================================================

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerExit {
    #[default]
    Drained,
    Cancelled,
}

/// Per-worker counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,

    /// Items whose work ran and whose acknowledgment succeeded
    pub processed: usize,
    pub malformed: usize,

    /// Items dropped after exceeding the delivery limit
    pub poison: usize,
    pub leases_lost: usize,
    pub work_failures: usize,
    pub duplicates_skipped: usize,
    pub exit: WorkerExit,
}

impl WorkerReport {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }
}

/// Failure that ended a worker's loop
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {} failed during {operation}: {source}", .report.worker_id)]
    Transport {
        operation: &'static str,
        report: WorkerReport,
        #[source]
        source: QueueError,
    },

    #[error("Worker {worker_id} could not start: {source}")]
    Configuration {
        worker_id: usize,
        #[source]
        source: ConfigError,
    },

    #[error("Worker {worker_id} panicked: {message}")]
    Panicked { worker_id: usize, message: String },
}

impl WorkerError {
    pub fn worker_id(&self) -> usize {
        match self {
            Self::Transport { report, .. } => report.worker_id,
            Self::Configuration { worker_id, .. } | Self::Panicked { worker_id, .. } => *worker_id,
        }
    }

    /// Counters gathered before the failure, if the worker got that far
    pub fn report(&self) -> Option<&WorkerReport> {
        match self {
            Self::Transport { report, .. } => Some(report),
            Self::Configuration { .. } | Self::Panicked { .. } => None,
        }
    }

    /// A failed worker still counts as useful if it processed something
    pub fn processed_any(&self) -> bool {
        self.report().map(|r| r.processed > 0).unwrap_or(false)
    }
}

/// Result of the idle check when the count reads zero
enum IdleOutcome {
    Drained,
    KeepPolling,
}

/// How a delivered item was settled
enum Settled {
    Processed,
    Malformed,
    Poison,
    Duplicate,
    Failed,
    LeaseLost,
}

// ============================================================================
// Worker
// ============================================================================

/// A single consumer running the lease loop
pub struct Worker {
    id: usize,
    client: Arc<dyn QueueClient>,
    queue: QueueName,
    poison_queue: QueueName,
    config: ConsumerConfig,
    work: Arc<dyn WorkUnit>,
    dedup: Option<Arc<DedupCache>>,
    tracker: Option<Arc<DrainTracker>>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Create a worker for `queue`
    ///
    /// Under the coordinated policy the worker gets its own drain tracker;
    /// pools replace it with a shared one through [`Worker::with_tracker`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the consumer configuration is invalid or the
    /// poison queue name cannot be derived from `queue`.
    pub fn new(
        id: usize,
        client: Arc<dyn QueueClient>,
        queue: QueueName,
        config: ConsumerConfig,
        work: Arc<dyn WorkUnit>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let poison_queue = poison_queue_name(&queue, &config)?;
        let tracker = match config.drain_policy {
            DrainPolicy::Coordinated => Some(Arc::new(DrainTracker::new())),
            DrainPolicy::PerWorker => None,
        };
        let dedup = config.dedup_ttl().map(|ttl| Arc::new(DedupCache::new(ttl)));

        Ok(Self {
            id,
            client,
            queue,
            poison_queue,
            config,
            work,
            dedup,
            tracker,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_tracker(mut self, tracker: Arc<DrainTracker>) -> Self {
        if self.config.drain_policy == DrainPolicy::Coordinated {
            self.tracker = Some(tracker);
        }
        self
    }

    pub fn with_dedup(mut self, dedup: Option<Arc<DedupCache>>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the lease loop until the queue is drained or shutdown is requested
    pub async fn run(self) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport::new(self.id);
        debug!(worker = self.id, queue = %self.queue, "Worker started");

        loop {
            if self.shutdown.is_cancelled() {
                info!(worker = self.id, "Worker stopping on shutdown request");
                report.exit = WorkerExit::Cancelled;
                return Ok(report);
            }
            if self.tracker.as_ref().is_some_and(|t| t.is_drained()) {
                report.exit = WorkerExit::Drained;
                return Ok(report);
            }

            // Poll
            let before = self.tracker.as_ref().map(|t| t.snapshot());
            let count = match self.client.approximate_message_count(&self.queue).await {
                Ok(count) => count,
                Err(source) => return Err(self.transport_failure("poll", report, source)),
            };

            if count == 0 {
                match self.idle_check(before).await {
                    IdleOutcome::Drained => {
                        info!(worker = self.id, queue = %self.queue, "Queue drained");
                        report.exit = WorkerExit::Drained;
                        return Ok(report);
                    }
                    IdleOutcome::KeepPolling => continue,
                }
            }

            // Lease
            let lease_guard = self.tracker.as_ref().map(|t| t.begin_lease());
            let received = match self
                .client
                .receive_message(&self.queue, self.config.visibility_timeout())
                .await
            {
                Ok(received) => received,
                Err(source) => return Err(self.transport_failure("lease", report, source)),
            };

            let Some(message) = received else {
                drop(lease_guard);
                debug!(worker = self.id, "Receive returned nothing");
                self.pause(self.config.empty_receive_backoff()).await;
                continue;
            };

            // Process and acknowledge
            match self.settle(&message, &mut report).await {
                Ok(Settled::Processed) => report.processed += 1,
                Ok(Settled::Malformed) => report.malformed += 1,
                Ok(Settled::Poison) => report.poison += 1,
                Ok(Settled::Duplicate) => report.duplicates_skipped += 1,
                Ok(Settled::Failed) => report.work_failures += 1,
                Ok(Settled::LeaseLost) => {}
                Err((operation, source)) => {
                    return Err(self.transport_failure(operation, report, source))
                }
            }
            drop(lease_guard);
        }
    }

    /// Decide whether a zero count means the queue is drained
    async fn idle_check(&self, before: Option<TrackerSnapshot>) -> IdleOutcome {
        let (Some(tracker), Some(before)) = (self.tracker.as_ref(), before) else {
            return IdleOutcome::Drained;
        };

        let after = tracker.snapshot();
        if before.is_quiescent() && before == after {
            if tracker.declare_drained() {
                debug!(worker = self.id, epoch = after.epoch, "Declared global drain");
            }
            return IdleOutcome::Drained;
        }

        debug!(
            worker = self.id,
            in_flight = after.in_flight,
            "Count is zero but leases are outstanding"
        );
        tokio::select! {
            _ = tracker.wait_for_change(self.config.drain_poll_interval()) => {}
            _ = self.shutdown.cancelled() => {}
        }
        IdleOutcome::KeepPolling
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Process one delivered item and settle it with the queue
    async fn settle(
        &self,
        message: &ReceivedMessage,
        report: &mut WorkerReport,
    ) -> Result<Settled, (&'static str, QueueError)> {
        if let Some(max) = self.config.max_delivery_count {
            if message.has_exceeded_max_delivery_count(max) {
                warn!(
                    worker = self.id,
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    max_delivery_count = max,
                    "Message exceeded delivery limit"
                );
                self.discard(message, &message.receipt_handle, report).await?;
                return Ok(Settled::Poison);
            }
        }

        if let Some(dedup) = &self.dedup {
            if dedup.contains(&message.message_id) {
                debug!(worker = self.id, message_id = %message.message_id, "Skipping completed message");
                self.acknowledge(&message.receipt_handle, report).await?;
                return Ok(Settled::Duplicate);
            }
        }

        let (outcome, receipt) = self.process(message).await;
        match outcome {
            Ok(()) => {
                info!(
                    worker = self.id,
                    message_id = %message.message_id,
                    "Processed message {} in worker {}",
                    message.message_id,
                    self.id
                );
                if let Some(dedup) = &self.dedup {
                    dedup.record(&message.message_id);
                }
                if self.acknowledge(&receipt, report).await? {
                    Ok(Settled::Processed)
                } else {
                    Ok(Settled::LeaseLost)
                }
            }
            Err(WorkError::Malformed(codec_error)) => {
                warn!(
                    worker = self.id,
                    message_id = %message.message_id,
                    error = %codec_error,
                    "Discarding malformed message"
                );
                self.discard(message, &receipt, report).await?;
                Ok(Settled::Malformed)
            }
            Err(WorkError::Failed { message: reason }) => {
                warn!(
                    worker = self.id,
                    message_id = %message.message_id,
                    error = %reason,
                    "Work failed, releasing lease"
                );
                self.abandon(&receipt, report).await?;
                Ok(Settled::Failed)
            }
        }
    }

    /// Run the unit of work, renewing the lease if configured
    ///
    /// Returns the work outcome with the receipt that is current afterwards.
    async fn process(&self, message: &ReceivedMessage) -> (Result<(), WorkError>, ReceiptHandle) {
        let context = WorkContext {
            message_id: &message.message_id,
            body: &message.body,
            delivery_count: message.delivery_count,
            worker_id: self.id,
        };
        let mut receipt = message.receipt_handle.clone();

        let Some(interval) = self.config.lease_renewal_interval() else {
            return (self.work.run(context).await, receipt);
        };

        let work = self.work.run(context);
        tokio::pin!(work);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut renewing = true;

        loop {
            tokio::select! {
                outcome = &mut work => return (outcome, receipt),
                _ = ticker.tick(), if renewing => {
                    match self
                        .client
                        .update_visibility(&self.queue, &receipt, self.config.visibility_timeout())
                        .await
                    {
                        Ok(renewed) => {
                            debug!(worker = self.id, message_id = %message.message_id, "Lease renewed");
                            receipt = renewed;
                        }
                        Err(e) if e.is_lease_lost() => {
                            warn!(worker = self.id, message_id = %message.message_id, "Lease lost before renewal");
                            renewing = false;
                        }
                        Err(e) => {
                            warn!(worker = self.id, message_id = %message.message_id, error = %e, "Lease renewal failed");
                        }
                    }
                }
            }
        }
    }

    /// Delete a settled item; returns false if the lease had already been lost
    async fn acknowledge(
        &self,
        receipt: &ReceiptHandle,
        report: &mut WorkerReport,
    ) -> Result<bool, (&'static str, QueueError)> {
        match self.client.delete_message(&self.queue, receipt).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_lease_lost() => {
                warn!(
                    worker = self.id,
                    message_id = %receipt.message_id(),
                    "Lease lost before acknowledgment; message will be redelivered"
                );
                report.leases_lost += 1;
                Ok(false)
            }
            Err(e) => Err(("acknowledge", e)),
        }
    }

    /// Make a failed item visible again
    async fn abandon(
        &self,
        receipt: &ReceiptHandle,
        report: &mut WorkerReport,
    ) -> Result<(), (&'static str, QueueError)> {
        match self
            .client
            .update_visibility(&self.queue, receipt, chrono::Duration::zero())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_lease_lost() => {
                report.leases_lost += 1;
                Ok(())
            }
            Err(e) => Err(("abandon", e)),
        }
    }

    /// Remove an item that can never be processed
    async fn discard(
        &self,
        message: &ReceivedMessage,
        receipt: &ReceiptHandle,
        report: &mut WorkerReport,
    ) -> Result<(), (&'static str, QueueError)> {
        if self.config.malformed_policy == MalformedPolicy::DeadLetter {
            self.client
                .create_queue_if_absent(&self.poison_queue)
                .await
                .map_err(|e| ("dead_letter", e))?;
            self.client
                .send_message(&self.poison_queue, message.message())
                .await
                .map_err(|e| ("dead_letter", e))?;
            info!(
                worker = self.id,
                message_id = %message.message_id,
                poison_queue = %self.poison_queue,
                "Message dead-lettered"
            );
        }
        self.acknowledge(receipt, report).await.map(|_| ())
    }

    fn transport_failure(
        &self,
        operation: &'static str,
        report: WorkerReport,
        source: QueueError,
    ) -> WorkerError {
        error!(
            worker = self.id,
            queue = %self.queue,
            operation,
            error = %source,
            "Worker stopped on transport failure"
        );
        WorkerError::Transport {
            operation,
            report,
            source,
        }
    }
}

/// Name of the queue that receives dead-lettered items
pub fn poison_queue_name(queue: &QueueName, config: &ConsumerConfig) -> Result<QueueName, ConfigError> {
    queue
        .with_suffix(&config.poison_queue_suffix)
        .map_err(|e| ConfigError::Invalid {
            field: "poison_queue_suffix".to_string(),
            message: e.to_string(),
        })
}
