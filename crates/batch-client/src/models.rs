//! Request and response models for the batch REST API.
//!
//! Field names follow the service's JSON (camelCase); optional fields are
//! omitted from requests when unset.

use serde::{Deserialize, Serialize};

/// Name/value pair exported into a task's environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSetting {
    pub name: String,
    pub value: String,
}

impl EnvironmentSetting {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Marketplace image used for pool nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineConfiguration {
    pub image_reference: ImageReference,
    #[serde(rename = "nodeAgentSKUId")]
    pub node_agent_sku_id: String,
}

/// Application package deployed to every node of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPackageReference {
    pub application_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// How tasks are spread over the nodes of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFillType {
    Spread,
    Pack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSchedulingPolicy {
    pub node_fill_type: NodeFillType,
}

/// Shape of the pool created for the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpecification {
    pub vm_size: String,
    pub target_dedicated_nodes: u32,
    pub task_slots_per_node: u32,
    pub task_scheduling_policy: TaskSchedulingPolicy,
    pub virtual_machine_configuration: VirtualMachineConfiguration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_package_references: Vec<ApplicationPackageReference>,
}

/// Lifetime of an auto-pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolLifetimeOption {
    Job,
    JobSchedule,
}

/// Pool created by the service when the job is submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoPoolSpecification {
    pub auto_pool_id_prefix: String,
    pub pool_lifetime_option: PoolLifetimeOption,
    pub keep_alive: bool,
    pub pool: PoolSpecification,
}

/// Where the job's tasks run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_pool_specification: Option<AutoPoolSpecification>,
}

impl PoolInformation {
    /// Run on an existing pool
    pub fn existing(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: Some(pool_id.into()),
            auto_pool_specification: None,
        }
    }

    /// Let the service create a pool for the job
    pub fn auto(spec: AutoPoolSpecification) -> Self {
        Self {
            pool_id: None,
            auto_pool_specification: Some(spec),
        }
    }
}

/// Job submission request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub id: String,
    pub pool_info: PoolInformation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub common_environment_settings: Vec<EnvironmentSetting>,
}

/// A task to add to a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: String,
    pub command_line: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_settings: Vec<EnvironmentSetting>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command_line: command_line.into(),
            environment_settings: Vec::new(),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Active,
    Preparing,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionInfo {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub retry_count: u32,
}

/// A task as reported by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub state: TaskState,
    #[serde(default)]
    pub command_line: Option<String>,
    #[serde(default)]
    pub execution_info: Option<TaskExecutionInfo>,
}

impl TaskInfo {
    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }

    /// Exit code once the task has run
    pub fn exit_code(&self) -> Option<i32> {
        self.execution_info.as_ref().and_then(|info| info.exit_code)
    }
}

// ============================================================================
// Wire envelopes
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct TaskCollection<'a> {
    pub value: &'a [TaskSpec],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddTaskResult {
    pub status: String,
    pub task_id: String,
    #[serde(default)]
    pub error: Option<ServiceErrorBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddTaskCollectionResult {
    #[serde(default)]
    pub value: Vec<AddTaskResult>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TaskListPage {
    #[serde(default)]
    pub value: Vec<TaskInfo>,
    #[serde(rename = "odata.nextLink", default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorMessage {
    #[serde(default)]
    pub value: String,
}

/// Error payload returned by the service
#[derive(Debug, Deserialize)]
pub(crate) struct ServiceErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: Option<ErrorMessage>,
}

impl ServiceErrorBody {
    pub fn message_text(&self) -> String {
        self.message
            .as_ref()
            .map(|m| m.value.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
