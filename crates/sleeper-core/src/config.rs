//! Configuration types for producers, consumers and batch job flows.
//!
//! Every struct deserializes with defaults so a partially specified file (or
//! none at all) still yields a usable configuration. Secrets are wiped on drop
//! and never printed.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Longest lease the storage service accepts
const MAX_VISIBILITY_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("Missing required setting: {field}")]
    Missing { field: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Secret
// ============================================================================

/// A secret string that is zeroed on drop and redacted in debug output
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Secret {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            f.write_str("<empty>")
        } else {
            f.write_str("<redacted>")
        }
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}

// ============================================================================
// Policies
// ============================================================================

/// How a worker pool decides that the queue is drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainPolicy {
    /// Each worker stops as soon as it sees a zero count
    PerWorker,

    /// Workers agree that nothing is queued and nothing is leased
    #[default]
    Coordinated,
}

impl std::str::FromStr for DrainPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-worker" => Ok(Self::PerWorker),
            "coordinated" => Ok(Self::Coordinated),
            other => Err(ConfigError::invalid(
                "drain_policy",
                format!("'{}' is not one of per-worker, coordinated", other),
            )),
        }
    }
}

/// What happens to an item that can never be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MalformedPolicy {
    #[default]
    Delete,

    /// Copy the item to the poison queue, then delete it
    DeadLetter,
}

// ============================================================================
// Queue, Producer and Consumer
// ============================================================================

/// Queue connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Queue that carries work items
    pub name: String,

    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Retries for transient transport failures
    pub max_retry_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "sleeper".to_string(),
            request_timeout_seconds: 30,
            max_retry_attempts: 3,
        }
    }
}

/// Producer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Number of concurrent senders
    pub sender_count: usize,

    /// Optional time-to-live for enqueued items
    pub message_ttl_seconds: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            sender_count: 1,
            message_ttl_seconds: None,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender_count == 0 {
            return Err(ConfigError::invalid("sender_count", "must be at least 1"));
        }
        Ok(())
    }

    pub fn message_ttl(&self) -> Option<chrono::Duration> {
        self.message_ttl_seconds.map(seconds_to_chrono)
    }
}

/// Consumer (lease loop and worker pool) settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Worker count; defaults to the host's available parallelism
    pub workers: Option<usize>,

    /// Lease length for each received item
    pub visibility_timeout_seconds: u64,

    pub drain_policy: DrainPolicy,

    pub malformed_policy: MalformedPolicy,

    /// Extend the lease on this interval while work runs
    pub lease_renewal_interval_seconds: Option<u64>,

    /// Deliveries after which an item is treated as poison; unset means no limit
    pub max_delivery_count: Option<u32>,

    /// Remember completed item ids for this long and skip their redeliveries
    pub dedup_ttl_seconds: Option<u64>,

    /// Pause after a receive that returned nothing
    pub empty_receive_backoff_ms: u64,

    /// Longest wait between count checks while siblings hold leases
    pub drain_poll_interval_ms: u64,

    /// Dead-lettered items go to `<queue>-<suffix>`
    pub poison_queue_suffix: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            visibility_timeout_seconds: 40,
            drain_policy: DrainPolicy::default(),
            malformed_policy: MalformedPolicy::default(),
            lease_renewal_interval_seconds: None,
            max_delivery_count: None,
            dedup_ttl_seconds: None,
            empty_receive_backoff_ms: 250,
            drain_poll_interval_ms: 1000,
            poison_queue_suffix: "poison".to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.visibility_timeout_seconds == 0
            || self.visibility_timeout_seconds > MAX_VISIBILITY_TIMEOUT_SECONDS
        {
            return Err(ConfigError::invalid(
                "visibility_timeout_seconds",
                format!("must be between 1 and {}", MAX_VISIBILITY_TIMEOUT_SECONDS),
            ));
        }
        if let Some(interval) = self.lease_renewal_interval_seconds {
            if interval == 0 || interval >= self.visibility_timeout_seconds {
                return Err(ConfigError::invalid(
                    "lease_renewal_interval_seconds",
                    "must be non-zero and shorter than the visibility timeout",
                ));
            }
        }
        if self.max_delivery_count == Some(0) {
            return Err(ConfigError::invalid("max_delivery_count", "must be at least 1"));
        }
        if self.poison_queue_suffix.is_empty() {
            return Err(ConfigError::invalid("poison_queue_suffix", "must not be empty"));
        }
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        seconds_to_chrono(self.visibility_timeout_seconds)
    }

    pub fn lease_renewal_interval(&self) -> Option<Duration> {
        self.lease_renewal_interval_seconds.map(Duration::from_secs)
    }

    pub fn dedup_ttl(&self) -> Option<Duration> {
        self.dedup_ttl_seconds.map(Duration::from_secs)
    }

    pub fn empty_receive_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_receive_backoff_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_visibility_timeout_seconds(mut self, seconds: u64) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }

    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn with_malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.malformed_policy = policy;
        self
    }
}

// ============================================================================
// Batch Account and Job Settings
// ============================================================================

/// Credentials for the batch and storage accounts
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    pub batch_account_name: String,
    pub batch_account_key: Secret,
    pub batch_account_url: String,
    pub storage_connection_string: Secret,
}

impl AccountSettings {
    /// Check that the batch account is fully specified
    pub fn validate_batch(&self) -> Result<(), ConfigError> {
        let missing = |field: &str| ConfigError::Missing {
            field: field.to_string(),
        };
        if self.batch_account_name.is_empty() {
            return Err(missing("batch_account_name"));
        }
        if self.batch_account_key.is_empty() {
            return Err(missing("batch_account_key"));
        }
        if self.batch_account_url.is_empty() {
            return Err(missing("batch_account_url"));
        }
        Ok(())
    }
}

/// Settings for the job submission flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Prefix for generated job ids
    pub job_id_prefix: String,

    /// Prefix for the auto-pool created with the job
    pub pool_id: String,
    pub pool_target_node_count: u32,
    pub pool_node_vm_size: String,
    pub image_publisher: String,
    pub image_offer: String,
    pub image_sku: String,
    pub image_version: String,
    pub node_agent_sku_id: String,

    /// Leave the job in place after completion
    pub job_keep_alive: bool,
    pub pool_keep_alive: bool,
    pub task_count: usize,
    pub task_command: String,
    pub application_id: String,
    pub application_version: Option<String>,

    /// Concurrent task collection requests
    pub max_degree_of_parallelism: usize,
    pub task_slots_per_node: u32,

    pub completion_timeout_seconds: u64,
    pub completion_poll_interval_seconds: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            job_id_prefix: "SleeperJob".to_string(),
            pool_id: "sleeper".to_string(),
            pool_target_node_count: 1,
            pool_node_vm_size: "STANDARD_D2S_V3".to_string(),
            image_publisher: "Canonical".to_string(),
            image_offer: "UbuntuServer".to_string(),
            image_sku: "18.04-LTS".to_string(),
            image_version: "latest".to_string(),
            node_agent_sku_id: "batch.node.ubuntu 18.04".to_string(),
            job_keep_alive: false,
            pool_keep_alive: false,
            task_count: 1,
            task_command: "/bin/sh -c \"sleeper-queue consume\"".to_string(),
            application_id: "sleeper".to_string(),
            application_version: None,
            max_degree_of_parallelism: 1,
            task_slots_per_node: 1,
            completion_timeout_seconds: 20 * 60,
            completion_poll_interval_seconds: 10,
        }
    }
}

impl JobSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_count == 0 {
            return Err(ConfigError::invalid("task_count", "must be at least 1"));
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(ConfigError::invalid(
                "max_degree_of_parallelism",
                "must be at least 1",
            ));
        }
        if self.task_slots_per_node == 0 {
            return Err(ConfigError::invalid("task_slots_per_node", "must be at least 1"));
        }
        if self.application_id.is_empty() {
            return Err(ConfigError::invalid("application_id", "must not be empty"));
        }
        Ok(())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_seconds)
    }

    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_secs(self.completion_poll_interval_seconds)
    }
}

/// Settings for the queue backlog monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Job that receives the extra tasks
    pub job_id: Option<String>,

    /// Queue whose backlog is watched; falls back to the work queue
    pub queue_name: Option<String>,

    pub tasks_per_round: usize,
    pub task_id_prefix: String,
    pub task_command: String,
    pub max_degree_of_parallelism: usize,
    pub poll_interval_seconds: u64,

    /// Stop after this many rounds even if the backlog remains
    pub max_rounds: Option<u32>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            job_id: None,
            queue_name: None,
            tasks_per_round: 10,
            task_id_prefix: "Task".to_string(),
            task_command: "/bin/sh -c \"sleeper-queue consume\"".to_string(),
            max_degree_of_parallelism: 1,
            poll_interval_seconds: 30,
            max_rounds: None,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.job_id.as_deref() {
            None | Some("") => {
                return Err(ConfigError::Missing {
                    field: "monitor.job_id".to_string(),
                })
            }
            Some(_) => {}
        }
        if self.tasks_per_round == 0 {
            return Err(ConfigError::invalid("tasks_per_round", "must be at least 1"));
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(ConfigError::invalid(
                "max_degree_of_parallelism",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

// ============================================================================
// Aggregate
// ============================================================================

/// Complete configuration as loaded from files and the environment
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SleeperConfig {
    pub queue: QueueSettings,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub account: AccountSettings,
    pub job: JobSettings,
    pub monitor: MonitorConfig,
}

fn seconds_to_chrono(seconds: u64) -> chrono::Duration {
    // chrono rejects second counts whose millisecond value overflows i64
    let max_seconds = (i64::MAX / 1000) as u64;
    chrono::Duration::seconds(seconds.min(max_seconds) as i64)
}
