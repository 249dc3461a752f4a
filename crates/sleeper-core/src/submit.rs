//! Batch job submission: create a job on an auto-pool, add its tasks, wait
//! for them to finish and collect their output.

use crate::config::{ConfigError, JobSettings, Secret};
use batch_client::{
    ApplicationPackageReference, AutoPoolSpecification, BatchError, BatchService,
    EnvironmentSetting, ImageReference, JobSpec, NodeFillType, PoolInformation,
    PoolLifetimeOption, PoolSpecification, TaskSchedulingPolicy, TaskSpec,
    VirtualMachineConfiguration,
};
use chrono::{DateTime, Local};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[cfg(test)]
#[path = "submit_tests.rs"]
mod tests;

/// Environment variable carrying the storage connection string into tasks
pub const STORAGE_CONNECTION_ENV: &str = "AZURE_STORAGE_CONNECTION_STRING";

/// Errors raised by the submission flow
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid job settings: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Batch operation '{operation}' failed for job '{job_id}': {source}")]
    Batch {
        operation: &'static str,
        job_id: String,
        #[source]
        source: BatchError,
    },
}

/// Standard output of one finished task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub task_id: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
}

/// Outcome of a completed submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub job_id: String,
    pub outputs: Vec<TaskOutput>,
    pub job_deleted: bool,
}

/// Job id of the form `{prefix}-{user}-{yyyyMMdd-HHmmss}`
pub fn create_job_id(prefix: &str, user: &str, now: DateTime<Local>) -> String {
    format!("{}-{}-{}", prefix, user, now.format("%Y%m%d-%H%M%S"))
}

/// Job definition with an auto-pool shaped by the settings
pub fn build_job(job_id: &str, settings: &JobSettings, storage_connection: &Secret) -> JobSpec {
    let pool = PoolSpecification {
        vm_size: settings.pool_node_vm_size.clone(),
        target_dedicated_nodes: settings.pool_target_node_count,
        task_slots_per_node: settings.task_slots_per_node,
        task_scheduling_policy: TaskSchedulingPolicy {
            node_fill_type: NodeFillType::Spread,
        },
        virtual_machine_configuration: VirtualMachineConfiguration {
            image_reference: ImageReference {
                publisher: settings.image_publisher.clone(),
                offer: settings.image_offer.clone(),
                sku: settings.image_sku.clone(),
                version: settings.image_version.clone(),
            },
            node_agent_sku_id: settings.node_agent_sku_id.clone(),
        },
        application_package_references: vec![ApplicationPackageReference {
            application_id: settings.application_id.clone(),
            version: settings.application_version.clone(),
        }],
    };

    let mut common_environment_settings = Vec::new();
    if !storage_connection.is_empty() {
        common_environment_settings.push(EnvironmentSetting::new(
            STORAGE_CONNECTION_ENV,
            storage_connection.expose(),
        ));
    }

    JobSpec {
        id: job_id.to_string(),
        pool_info: PoolInformation::auto(AutoPoolSpecification {
            auto_pool_id_prefix: settings.pool_id.clone(),
            pool_lifetime_option: PoolLifetimeOption::Job,
            keep_alive: settings.pool_keep_alive,
            pool,
        }),
        common_environment_settings,
    }
}

/// Tasks `{application_id}-{i}` all running the configured command
pub fn build_tasks(settings: &JobSettings) -> Vec<TaskSpec> {
    (0..settings.task_count)
        .map(|i| {
            TaskSpec::new(
                format!("{}-{}", settings.application_id, i),
                settings.task_command.clone(),
            )
        })
        .collect()
}

/// Runs the submit-and-wait flow against a batch service
pub struct JobSubmitter {
    batch: Arc<dyn BatchService>,
    settings: JobSettings,
    storage_connection: Secret,
}

impl JobSubmitter {
    pub fn new(
        batch: Arc<dyn BatchService>,
        settings: JobSettings,
        storage_connection: Secret,
    ) -> Result<Self, SubmitError> {
        settings.validate()?;
        Ok(Self {
            batch,
            settings,
            storage_connection,
        })
    }

    /// Submit a job named after `user` and the current time, then wait for it
    pub async fn submit(&self, user: &str) -> Result<SubmitReport, SubmitError> {
        let job_id = create_job_id(&self.settings.job_id_prefix, user, Local::now());
        self.submit_as(&job_id).await
    }

    /// Submit under an explicit job id
    ///
    /// Unless the settings keep the job alive it is deleted afterwards, even
    /// when submission or waiting failed.
    pub async fn submit_as(&self, job_id: &str) -> Result<SubmitReport, SubmitError> {
        info!(
            job_id,
            pool_id = %self.settings.pool_id,
            nodes = self.settings.pool_target_node_count,
            vm_size = %self.settings.pool_node_vm_size,
            tasks = self.settings.task_count,
            "Submitting job"
        );

        let outcome = self.run_job(job_id).await;

        if self.settings.job_keep_alive {
            return outcome.map(|outputs| SubmitReport {
                job_id: job_id.to_string(),
                outputs,
                job_deleted: false,
            });
        }

        info!(job_id, "Deleting job: {}", job_id);
        let deleted = self.batch.delete_job(job_id).await;
        match (outcome, deleted) {
            (Ok(outputs), Ok(())) => Ok(SubmitReport {
                job_id: job_id.to_string(),
                outputs,
                job_deleted: true,
            }),
            (Ok(_), Err(source)) => Err(SubmitError::Batch {
                operation: "delete_job",
                job_id: job_id.to_string(),
                source,
            }),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(delete_error)) => {
                error!(job_id, error = %delete_error, "Failed to delete job after an earlier failure");
                Err(e)
            }
        }
    }

    async fn run_job(&self, job_id: &str) -> Result<Vec<TaskOutput>, SubmitError> {
        let batch_error = |operation: &'static str| {
            move |source: BatchError| SubmitError::Batch {
                operation,
                job_id: job_id.to_string(),
                source,
            }
        };

        let job = build_job(job_id, &self.settings, &self.storage_connection);
        self.batch
            .create_job(&job)
            .await
            .map_err(batch_error("create_job"))?;

        self.batch
            .add_tasks(
                job_id,
                build_tasks(&self.settings),
                self.settings.max_degree_of_parallelism,
            )
            .await
            .map_err(batch_error("add_tasks"))?;

        info!(job_id, "Waiting for all tasks to complete on job: {} ...", job_id);
        let tasks = self
            .batch
            .wait_for_completion(
                job_id,
                self.settings.completion_timeout(),
                self.settings.completion_poll_interval(),
            )
            .await
            .map_err(batch_error("wait_for_completion"))?;

        let mut outputs = Vec::with_capacity(tasks.len());
        for task in tasks {
            let stdout = self
                .batch
                .read_task_output(job_id, &task.id)
                .await
                .map_err(batch_error("read_task_output"))?;
            info!(job_id, task_id = %task.id, exit_code = ?task.exit_code(), "Task {} finished", task.id);
            outputs.push(TaskOutput {
                exit_code: task.exit_code(),
                task_id: task.id,
                stdout,
            });
        }

        Ok(outputs)
    }
}
