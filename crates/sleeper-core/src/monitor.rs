//! Queue backlog monitor.
//!
//! While the watched queue still has items the monitor adds a round of
//! consumer tasks to an existing batch job, then waits before looking again.

use crate::config::{ConfigError, MonitorConfig};
use batch_client::{BatchError, BatchService, TaskSpec};
use queue_runtime::{QueueClient, QueueError, QueueName};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Invalid monitor settings: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to read backlog of queue '{queue}': {source}")]
    Queue {
        queue: String,
        #[source]
        source: QueueError,
    },

    #[error("Failed to add tasks to job '{job_id}': {source}")]
    Batch {
        job_id: String,
        #[source]
        source: BatchError,
    },
}

/// Why the monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Drained,
    RoundLimit,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub rounds: u32,
    pub tasks_added: usize,
    pub exit: MonitorExit,
}

/// Task ids for one round, unique across rounds
pub fn round_tasks(config: &MonitorConfig, round: u32) -> Vec<TaskSpec> {
    (0..config.tasks_per_round)
        .map(|i| {
            TaskSpec::new(
                format!("{}-{}-{}", config.task_id_prefix, round, i),
                config.task_command.clone(),
            )
        })
        .collect()
}

pub struct BacklogMonitor {
    queue_client: Arc<dyn QueueClient>,
    queue: QueueName,
    batch: Arc<dyn BatchService>,
    job_id: String,
    config: MonitorConfig,
    shutdown: CancellationToken,
}

impl BacklogMonitor {
    /// Create a monitor feeding the job named in `config`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no job id is configured or a round is empty.
    pub fn new(
        queue_client: Arc<dyn QueueClient>,
        queue: QueueName,
        batch: Arc<dyn BatchService>,
        config: MonitorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let job_id = config.job_id.clone().unwrap_or_default();
        Ok(Self {
            queue_client,
            queue,
            batch,
            job_id,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Add task rounds until the queue is empty
    pub async fn run(&self) -> Result<MonitorReport, MonitorError> {
        let mut report = MonitorReport {
            rounds: 0,
            tasks_added: 0,
            exit: MonitorExit::Drained,
        };

        loop {
            if self.shutdown.is_cancelled() {
                report.exit = MonitorExit::Cancelled;
                break;
            }

            let count = self
                .queue_client
                .approximate_message_count(&self.queue)
                .await
                .map_err(|source| MonitorError::Queue {
                    queue: self.queue.to_string(),
                    source,
                })?;
            info!(queue = %self.queue, count, "Queue backlog");
            if count == 0 {
                info!(queue = %self.queue, "Queue drained");
                break;
            }

            if matches!(self.config.max_rounds, Some(max) if report.rounds >= max) {
                warn!(
                    queue = %self.queue,
                    rounds = report.rounds,
                    count,
                    "Round limit reached with items still queued"
                );
                report.exit = MonitorExit::RoundLimit;
                break;
            }

            let tasks = round_tasks(&self.config, report.rounds);
            let added = tasks.len();
            self.batch
                .add_tasks(&self.job_id, tasks, self.config.max_degree_of_parallelism)
                .await
                .map_err(|source| MonitorError::Batch {
                    job_id: self.job_id.clone(),
                    source,
                })?;
            report.rounds += 1;
            report.tasks_added += added;
            info!(
                job_id = %self.job_id,
                round = report.rounds,
                added,
                "Added {} tasks to job {}",
                added,
                self.job_id
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    report.exit = MonitorExit::Cancelled;
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        Ok(report)
    }
}
