//! # Sleeper CLI
//!
//! Command-line interface for the sleeper work queue.
//!
//! This module provides commands for:
//! - Producing work items, optionally fanned out over several senders
//! - Consuming the queue with a pool of workers until it is drained
//! - Submitting a batch job whose tasks consume the queue
//! - Topping up a running job while a backlog remains

use batch_client::{BatchClient, BatchClientConfig, BatchCredentials, BatchError};
use clap::{Parser, Subcommand};
use queue_runtime::{
    AzureStorageConfig, ConfigurationError, ProviderConfig, QueueClient, QueueClientFactory,
    QueueConfig, QueueError, QueueName,
};
use sleeper_core::{
    BacklogMonitor, ConfigError, DrainCoordinator, DrainError, DrainPolicy, JobSubmitter,
    MonitorError, ProduceError, Producer, Secret, SleepPayload, SleepWork, SleeperConfig,
    SubmitError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Prefix of environment variables read into [`SleeperConfig`]
pub const ENV_PREFIX: &str = "SLEEPER";

// ============================================================================
// CLI Structure
// ============================================================================

/// Sleeper queue - distribute sleep work items through a durable queue
#[derive(Parser, Debug)]
#[command(name = "sleeper-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Produce, consume and schedule work items on a storage queue")]
pub struct Cli {
    /// Configuration file path (toml, json or yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Logging level used when RUST_LOG is not set
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Queue that carries work items [default: sleeper]
    #[arg(long, global = true, env = "QUEUE_NAME")]
    pub queue_name: Option<String>,

    /// Storage account connection string
    #[arg(long, global = true, env = "AZURE_STORAGE_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: Option<String>,

    #[command(flatten)]
    pub batch: BatchAccountArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Batch account credentials
#[derive(clap::Args, Debug, Default)]
pub struct BatchAccountArgs {
    #[arg(long, global = true, env = "BATCH_ACCOUNT_NAME")]
    pub batch_account_name: Option<String>,

    #[arg(long, global = true, env = "BATCH_ACCOUNT_KEY", hide_env_values = true)]
    pub batch_account_key: Option<String>,

    #[arg(long, global = true, env = "BATCH_ACCOUNT_URL")]
    pub batch_account_url: Option<String>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enqueue copies of a work item
    Produce {
        /// Number of items to enqueue
        count: usize,

        /// Seconds each item makes a worker sleep
        payload: SleepPayload,

        /// Number of concurrent senders
        thread_count: Option<usize>,
    },

    /// Process items until the queue is drained
    Consume {
        /// Worker pool size [default: available parallelism]
        #[arg(short, long)]
        workers: Option<usize>,

        /// Lease length in seconds
        #[arg(long)]
        visibility_timeout: Option<u64>,

        /// How workers decide the queue is drained
        #[arg(long)]
        policy: Option<DrainPolicy>,
    },

    /// Submit a batch job and wait for its tasks
    Submit {
        /// User name embedded in the job id
        #[arg(long, env = "USER")]
        user: Option<String>,
    },

    /// Add tasks to a running job while the queue has a backlog
    Monitor {
        /// Job that receives the extra tasks
        #[arg(long, env = "JOB_ID")]
        job_id: Option<String>,

        /// Queue to watch [default: the work queue]
        #[arg(long, env = "JOB_QUEUE")]
        job_queue: Option<String>,

        /// Stop after this many rounds
        #[arg(long)]
        max_rounds: Option<u32>,
    },
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI-level errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Settings(#[from] ConfigError),

    #[error("Invalid queue configuration: {0}")]
    QueueSettings(#[from] ConfigurationError),

    #[error("Failed to initialize logging: {message}")]
    Logging { message: String },

    #[error("Queue transport error: {0}")]
    Transport(#[from] QueueError),

    #[error("Produce failed: {0}")]
    Produce(#[from] ProduceError),

    #[error("No worker produced a useful result: {0}")]
    Drain(#[from] DrainError),

    #[error("Batch service error: {0}")]
    Batch(#[from] BatchError),

    #[error("Job submission failed: {0}")]
    Submit(#[from] SubmitError),

    #[error("Monitor failed: {0}")]
    Monitor(#[from] MonitorError),
}

impl CliError {
    /// Process exit code for this error
    ///
    /// `1` for arguments and configuration, `2` for queue transport failures
    /// and drains where no worker was useful, `3` for batch service failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Load(_) | Self::Settings(_) | Self::QueueSettings(_) | Self::Logging { .. } => 1,
            Self::Transport(e) if matches!(e, QueueError::ConfigurationError(_)) => 1,
            Self::Transport(_) | Self::Drain(_) => 2,
            Self::Produce(ProduceError::Configuration(_) | ProduceError::Codec(_)) => 1,
            Self::Produce(_) => 2,
            Self::Batch(BatchError::Configuration { .. }) => 1,
            Self::Batch(_) => 3,
            Self::Submit(SubmitError::Configuration(_)) => 1,
            Self::Submit(SubmitError::Batch { .. }) => 3,
            Self::Monitor(MonitorError::Configuration(_)) => 1,
            Self::Monitor(MonitorError::Queue { .. }) => 2,
            Self::Monitor(MonitorError::Batch { .. }) => 3,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Load configuration from an optional file, then `SLEEPER__*` variables
///
/// `SLEEPER__CONSUMER__WORKERS=4` sets `consumer.workers`. Every field has a
/// default, so neither source is required.
pub fn load_configuration(path: Option<&Path>) -> Result<SleeperConfig, CliError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(config.try_deserialize()?)
}

/// Overlay global flags and well-known environment variables
pub fn apply_global_overrides(cli: &Cli, config: &mut SleeperConfig) {
    if let Some(name) = &cli.queue_name {
        config.queue.name = name.clone();
    }
    if let Some(connection) = &cli.connection_string {
        config.account.storage_connection_string = Secret::new(connection.clone());
    }
    if let Some(name) = &cli.batch.batch_account_name {
        config.account.batch_account_name = name.clone();
    }
    if let Some(key) = &cli.batch.batch_account_key {
        config.account.batch_account_key = Secret::new(key.clone());
    }
    if let Some(url) = &cli.batch.batch_account_url {
        config.account.batch_account_url = url.clone();
    }
}

fn queue_name(name: &str) -> Result<QueueName, CliError> {
    QueueName::new(name.to_string()).map_err(|e| {
        CliError::Settings(ConfigError::Invalid {
            field: "queue.name".to_string(),
            message: e.to_string(),
        })
    })
}

fn queue_client(config: &SleeperConfig) -> Result<Arc<dyn QueueClient>, CliError> {
    let connection = &config.account.storage_connection_string;
    if connection.is_empty() {
        return Err(CliError::Settings(ConfigError::Missing {
            field: "account.storage_connection_string".to_string(),
        }));
    }

    let queue_config = QueueConfig {
        provider: ProviderConfig::AzureStorage(AzureStorageConfig::from_connection_string(
            connection.expose(),
        )?),
        request_timeout: Duration::from_secs(config.queue.request_timeout_seconds),
        max_retry_attempts: config.queue.max_retry_attempts,
        ..QueueConfig::default()
    };
    Ok(QueueClientFactory::create_client(queue_config)?)
}

fn batch_client(config: &SleeperConfig) -> Result<Arc<BatchClient>, CliError> {
    let account = &config.account;
    account.validate_batch()?;
    let credentials = BatchCredentials::new(
        &account.batch_account_url,
        &account.batch_account_name,
        account.batch_account_key.expose(),
    )?;
    Ok(Arc::new(BatchClient::new(credentials, BatchClientConfig::default())?))
}

/// Cancel `shutdown` on the first Ctrl-C
fn shutdown_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received; finishing current items");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupts"),
        }
    });
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Initialize logging based on CLI arguments
///
/// `RUST_LOG` wins over `--log-level` when set.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Run a parsed command line
pub async fn run_cli(cli: Cli) -> Result<(), CliError> {
    initialize_logging(&cli)?;

    let mut config = load_configuration(cli.config.as_deref())?;
    apply_global_overrides(&cli, &mut config);

    match cli.command {
        Commands::Produce {
            count,
            payload,
            thread_count,
        } => execute_produce_command(config, count, payload, thread_count).await,
        Commands::Consume {
            workers,
            visibility_timeout,
            policy,
        } => execute_consume_command(config, workers, visibility_timeout, policy).await,
        Commands::Submit { user } => execute_submit_command(config, user).await,
        Commands::Monitor {
            job_id,
            job_queue,
            max_rounds,
        } => execute_monitor_command(config, job_id, job_queue, max_rounds).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn execute_produce_command(
    mut config: SleeperConfig,
    count: usize,
    payload: SleepPayload,
    thread_count: Option<usize>,
) -> Result<(), CliError> {
    if let Some(senders) = thread_count {
        config.producer.sender_count = senders;
    }
    let queue = queue_name(&config.queue.name)?;
    let producer = Producer::new(queue_client(&config)?, queue, config.producer)?;

    let report = producer.produce(count, &payload).await?;
    info!(
        items_sent = report.items_sent,
        senders = report.sender_count,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Produced {} messages",
        report.items_sent
    );
    Ok(())
}

/// Apply consume flags to the consumer settings
pub fn consumer_overrides(
    config: &mut SleeperConfig,
    workers: Option<usize>,
    visibility_timeout: Option<u64>,
    policy: Option<DrainPolicy>,
) {
    if let Some(workers) = workers {
        config.consumer = config.consumer.clone().with_workers(workers);
    }
    if let Some(seconds) = visibility_timeout {
        config.consumer = config.consumer.clone().with_visibility_timeout_seconds(seconds);
    }
    if let Some(policy) = policy {
        config.consumer = config.consumer.clone().with_drain_policy(policy);
    }
}

async fn execute_consume_command(
    mut config: SleeperConfig,
    workers: Option<usize>,
    visibility_timeout: Option<u64>,
    policy: Option<DrainPolicy>,
) -> Result<(), CliError> {
    consumer_overrides(&mut config, workers, visibility_timeout, policy);
    let pool_size = config.consumer.pool_size();
    let queue = queue_name(&config.queue.name)?;

    let coordinator = DrainCoordinator::new(
        queue_client(&config)?,
        queue,
        config.consumer,
        Arc::new(SleepWork),
    )?;
    shutdown_on_ctrl_c(coordinator.shutdown_token());

    match coordinator.drain(pool_size).await {
        Ok(report) => {
            if report.was_cancelled() {
                warn!(processed = report.processed(), "Consumption interrupted");
            }
            Ok(())
        }
        Err(drain_error) => {
            for worker_error in &drain_error.errors {
                error!(worker = worker_error.worker_id(), error = %worker_error, "Worker failed");
            }
            if drain_error.has_useful_worker() {
                warn!(
                    processed = drain_error.processed(),
                    failed = drain_error.errors.len(),
                    "Some workers failed; others completed"
                );
                Ok(())
            } else {
                Err(drain_error.into())
            }
        }
    }
}

async fn execute_submit_command(
    config: SleeperConfig,
    user: Option<String>,
) -> Result<(), CliError> {
    let batch = batch_client(&config)?;
    let submitter = JobSubmitter::new(
        batch,
        config.job,
        config.account.storage_connection_string.clone(),
    )?;

    let user = user.unwrap_or_else(|| "sleeper".to_string());
    let report = submitter.submit(&user).await?;
    for output in &report.outputs {
        println!("Task {}", output.task_id);
        println!("{}", output.stdout);
    }
    info!(job_id = %report.job_id, deleted = report.job_deleted, "Job finished");
    Ok(())
}

async fn execute_monitor_command(
    mut config: SleeperConfig,
    job_id: Option<String>,
    job_queue: Option<String>,
    max_rounds: Option<u32>,
) -> Result<(), CliError> {
    if job_id.is_some() {
        config.monitor.job_id = job_id;
    }
    if job_queue.is_some() {
        config.monitor.queue_name = job_queue;
    }
    if max_rounds.is_some() {
        config.monitor.max_rounds = max_rounds;
    }

    let watched = config
        .monitor
        .queue_name
        .clone()
        .unwrap_or_else(|| config.queue.name.clone());
    let queue = queue_name(&watched)?;
    let batch = batch_client(&config)?;
    let monitor = BacklogMonitor::new(queue_client(&config)?, queue, batch, config.monitor)?;

    let shutdown = CancellationToken::new();
    shutdown_on_ctrl_c(shutdown.clone());
    let report = monitor.with_shutdown(shutdown).run().await?;
    info!(
        rounds = report.rounds,
        tasks_added = report.tasks_added,
        exit = ?report.exit,
        "Monitoring finished"
    );
    Ok(())
}
