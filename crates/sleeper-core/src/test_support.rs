//! Shared fixtures for unit tests.

use crate::codec::{Payload, SleepPayload};
use crate::work::{WorkContext, WorkError, WorkUnit};
use async_trait::async_trait;
use batch_client::{
    BatchError, BatchService, JobSpec, TaskExecutionInfo, TaskInfo, TaskSpec, TaskState,
};
use chrono::Duration;
use queue_runtime::provider::ProviderType;
use queue_runtime::{
    InMemoryProvider, Message, MessageId, QueueClient, QueueError, QueueName, ReceiptHandle,
    ReceivedMessage, RetryPolicy, StandardQueueClient,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn queue_name(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

/// An in-memory client plus a handle for inspecting the same storage
pub fn memory_client() -> (Arc<dyn QueueClient>, InMemoryProvider) {
    let provider = InMemoryProvider::default();
    let client = StandardQueueClient::new(Box::new(provider.clone()), RetryPolicy::none());
    (Arc::new(client), provider)
}

pub async fn seed(client: &dyn QueueClient, queue: &QueueName, bodies: &[&str]) {
    client.create_queue_if_absent(queue).await.unwrap();
    for body in bodies {
        client
            .send_message(queue, Message::new(body.to_string()))
            .await
            .unwrap();
    }
}

fn injected(operation: &str) -> QueueError {
    QueueError::ConnectionFailed {
        message: format!("injected {} failure", operation),
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

/// Client wrapper that fails selected operations
pub struct FaultyClient {
    inner: Arc<dyn QueueClient>,
    pub sends_before_failure: Option<usize>,
    pub fail_counts: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub fail_receives: AtomicBool,
    sends: AtomicUsize,
}

impl FaultyClient {
    pub fn new(inner: Arc<dyn QueueClient>) -> Self {
        Self {
            inner,
            sends_before_failure: None,
            fail_counts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_receives: AtomicBool::new(false),
            sends: AtomicUsize::new(0),
        }
    }

    pub fn failing_sends_after(mut self, sends: usize) -> Self {
        self.sends_before_failure = Some(sends);
        self
    }
}

#[async_trait]
impl QueueClient for FaultyClient {
    async fn create_queue_if_absent(&self, queue: &QueueName) -> Result<bool, QueueError> {
        self.inner.create_queue_if_absent(queue).await
    }

    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        let attempt = self.sends.fetch_add(1, Ordering::SeqCst);
        if matches!(self.sends_before_failure, Some(limit) if attempt >= limit) {
            return Err(injected("send"));
        }
        self.inner.send_message(queue, message).await
    }

    async fn approximate_message_count(&self, queue: &QueueName) -> Result<u64, QueueError> {
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(injected("count"));
        }
        self.inner.approximate_message_count(queue).await
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        if self.fail_receives.load(Ordering::SeqCst) {
            return Err(injected("receive"));
        }
        self.inner.receive_message(queue, visibility_timeout).await
    }

    async fn delete_message(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected("delete"));
        }
        self.inner.delete_message(queue, receipt).await
    }

    async fn update_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        self.inner
            .update_visibility(queue, receipt, visibility_timeout)
            .await
    }

    fn provider_type(&self) -> ProviderType {
        self.inner.provider_type()
    }
}

// ============================================================================
// Work Units
// ============================================================================

/// Sleeps like [`crate::work::SleepWork`] and counts runs per message id
#[derive(Default)]
pub struct CountingWork {
    runs: Mutex<HashMap<MessageId, usize>>,
    failures_remaining: AtomicUsize,
    slow_runs_remaining: AtomicUsize,
    slow_by: std::time::Duration,
}

impl CountingWork {
    /// Fail the first `failures` runs with a retryable error
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    /// Stretch the first `runs` runs by an extra `by`
    pub fn slow_first(runs: usize, by: std::time::Duration) -> Self {
        Self {
            slow_runs_remaining: AtomicUsize::new(runs),
            slow_by: by,
            ..Self::default()
        }
    }

    pub fn total_runs(&self) -> usize {
        self.runs.lock().unwrap().values().sum()
    }

    pub fn distinct_items(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn runs_for(&self, id: &MessageId) -> usize {
        self.runs.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WorkUnit for CountingWork {
    async fn run(&self, item: WorkContext<'_>) -> Result<(), WorkError> {
        let payload = SleepPayload::decode(item.body)?;
        *self
            .runs
            .lock()
            .unwrap()
            .entry(item.message_id.clone())
            .or_insert(0) += 1;

        let slow = self
            .slow_runs_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let extra = if slow { self.slow_by } else { std::time::Duration::ZERO };
        tokio::time::sleep(payload.duration() + extra).await;

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WorkError::failed("injected work failure"));
        }
        Ok(())
    }
}

// ============================================================================
// Batch Service
// ============================================================================

/// Batch call recorded by [`FakeBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchCall {
    CreateJob(String),
    AddTasks {
        job_id: String,
        task_ids: Vec<String>,
        max_parallelism: usize,
    },
    ListTasks(String),
    DeleteJob(String),
    ReadOutput(String),
}

/// In-process batch service whose tasks complete as soon as they are added
#[derive(Default)]
pub struct FakeBatch {
    pub calls: Mutex<Vec<BatchCall>>,
    pub jobs: Mutex<Vec<JobSpec>>,
    tasks: Mutex<Vec<TaskSpec>>,
    pub fail_create: AtomicBool,
    pub fail_add: AtomicBool,
    pub fail_delete: AtomicBool,
    pub never_complete: AtomicBool,
}

impl FakeBatch {
    pub fn calls(&self) -> Vec<BatchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn added_task_ids(&self) -> Vec<String> {
        self.tasks.lock().unwrap().iter().map(|t| t.id.clone()).collect()
    }

    fn record(&self, call: BatchCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn service_error(operation: &str) -> BatchError {
    BatchError::ServiceError {
        status: 500,
        code: "InternalError".to_string(),
        message: format!("injected {} failure", operation),
    }
}

#[async_trait]
impl BatchService for FakeBatch {
    async fn create_job(&self, job: &JobSpec) -> Result<(), BatchError> {
        self.record(BatchCall::CreateJob(job.id.clone()));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(service_error("create"));
        }
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn add_tasks(
        &self,
        job_id: &str,
        tasks: Vec<TaskSpec>,
        max_parallelism: usize,
    ) -> Result<(), BatchError> {
        self.record(BatchCall::AddTasks {
            job_id: job_id.to_string(),
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            max_parallelism,
        });
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(service_error("add"));
        }
        self.tasks.lock().unwrap().extend(tasks);
        Ok(())
    }

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<TaskInfo>, BatchError> {
        self.record(BatchCall::ListTasks(job_id.to_string()));
        let state = if self.never_complete.load(Ordering::SeqCst) {
            TaskState::Running
        } else {
            TaskState::Completed
        };
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| TaskInfo {
                id: t.id.clone(),
                state,
                command_line: Some(t.command_line.clone()),
                execution_info: (state == TaskState::Completed).then_some(TaskExecutionInfo {
                    exit_code: Some(0),
                    retry_count: 0,
                }),
            })
            .collect())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BatchError> {
        self.record(BatchCall::DeleteJob(job_id.to_string()));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(service_error("delete"));
        }
        Ok(())
    }

    async fn read_task_output(&self, _job_id: &str, task_id: &str) -> Result<String, BatchError> {
        self.record(BatchCall::ReadOutput(task_id.to_string()));
        Ok(format!("output of {}", task_id))
    }
}
