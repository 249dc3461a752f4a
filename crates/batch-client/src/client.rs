//! Batch service trait and its REST implementation.

use crate::auth::BatchCredentials;
use crate::error::{BatchError, TaskAddFailure};
use crate::models::{
    AddTaskCollectionResult, JobSpec, ServiceErrorBody, TaskCollection, TaskInfo, TaskListPage,
    TaskSpec,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::{Method, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Most tasks the service accepts in one add-collection request
pub const MAX_TASKS_PER_REQUEST: usize = 100;

/// File holding a task's standard output
pub const STANDARD_OUT_FILE: &str = "stdout.txt";

const JSON_CONTENT_TYPE: &str = "application/json; odata=minimalmetadata";

/// Operations the job submission and monitoring flows need from a batch service
#[async_trait]
pub trait BatchService: Send + Sync {
    /// Create a job
    async fn create_job(&self, job: &JobSpec) -> Result<(), BatchError>;

    /// Add tasks to a job, sending at most `max_parallelism` requests at once
    async fn add_tasks(
        &self,
        job_id: &str,
        tasks: Vec<TaskSpec>,
        max_parallelism: usize,
    ) -> Result<(), BatchError>;

    /// List every task of a job
    async fn list_tasks(&self, job_id: &str) -> Result<Vec<TaskInfo>, BatchError>;

    /// Delete a job and its tasks
    async fn delete_job(&self, job_id: &str) -> Result<(), BatchError>;

    /// Read a task's standard output
    async fn read_task_output(&self, job_id: &str, task_id: &str) -> Result<String, BatchError>;

    /// Poll the job's tasks until all are completed or `timeout` elapses
    async fn wait_for_completion(
        &self,
        job_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Vec<TaskInfo>, BatchError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let tasks = self.list_tasks(job_id).await?;
            let pending = tasks.iter().filter(|t| !t.is_completed()).count();
            if pending == 0 {
                return Ok(tasks);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(BatchError::CompletionTimeout {
                    job_id: job_id.to_string(),
                    timeout,
                });
            }

            debug!(
                job_id,
                pending,
                total = tasks.len(),
                "Waiting for tasks to complete"
            );
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Configuration for batch client behavior.
#[derive(Debug, Clone)]
pub struct BatchClientConfig {
    /// REST API version sent with every request
    pub api_version: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries for transient failures after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further retry
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for BatchClientConfig {
    fn default() -> Self {
        Self {
            api_version: "2023-05-01.17.0".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

impl BatchClientConfig {
    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

struct RawResponse {
    status: StatusCode,
    body: String,
}

/// Batch service client speaking the REST API with Shared Key auth
#[derive(Clone)]
pub struct BatchClient {
    credentials: BatchCredentials,
    http_client: reqwest::Client,
    config: BatchClientConfig,
}

impl BatchClient {
    /// Create a client for the account described by `credentials`
    pub fn new(
        credentials: BatchCredentials,
        config: BatchClientConfig,
    ) -> Result<Self, BatchError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BatchError::Configuration {
                message: format!("HTTP client: {}", e),
            })?;

        Ok(Self {
            credentials,
            http_client,
            config,
        })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &BatchClientConfig {
        &self.config
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BatchError> {
        let mut url = self.credentials.account_url().clone();
        url.path_segments_mut()
            .map_err(|_| BatchError::Configuration {
                message: "batch account URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("api-version", &self.config.api_version);
        Ok(url)
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&str>,
    ) -> Result<RawResponse, BatchError> {
        let mut ocp_headers = BTreeMap::new();
        ocp_headers.insert(
            "ocp-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );

        let content_type = body.map(|_| JSON_CONTENT_TYPE);
        let string_to_sign = self.credentials.string_to_sign(
            method,
            url,
            &ocp_headers,
            body.map(str::len).unwrap_or(0),
            content_type,
        );
        let authorization = self.credentials.authorization(&string_to_sign)?;

        let mut request = self
            .http_client
            .request(method.clone(), url.clone())
            .header("Authorization", authorization);
        for (name, value) in &ocp_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let (Some(body), Some(content_type)) = (body, content_type) {
            request = request
                .header("Content-Type", content_type)
                .body(body.to_string());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BatchError::RequestTimeout {
                    duration: self.config.timeout,
                }
            } else {
                BatchError::NetworkError {
                    message: format!("HTTP request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BatchError::NetworkError {
                message: format!("Failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            return Err(error_from_response(status, &body, url));
        }

        Ok(RawResponse { status, body })
    }

    /// Send a signed request, retrying transient failures with exponential backoff
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<RawResponse, BatchError> {
        let mut attempt = 0;
        loop {
            match self.send_once(&method, &url, body.as_deref()).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        method = %method,
                        path = url.path(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient batch service failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn add_task_chunk(
        &self,
        job_id: &str,
        chunk: &[TaskSpec],
    ) -> Result<Vec<TaskAddFailure>, BatchError> {
        let url = self.url(&["jobs", job_id, "addtaskcollection"])?;
        let body = serde_json::to_string(&TaskCollection { value: chunk }).map_err(|e| {
            BatchError::Serialization {
                message: e.to_string(),
            }
        })?;

        let response = self.send(Method::POST, url, Some(body)).await?;
        let result: AddTaskCollectionResult =
            serde_json::from_str(&response.body).map_err(|e| BatchError::Serialization {
                message: format!("add task collection result: {}", e),
            })?;

        Ok(result
            .value
            .into_iter()
            .filter(|r| !r.status.eq_ignore_ascii_case("success"))
            .map(|r| {
                let (code, message) = r
                    .error
                    .map(|e| (e.code.clone(), e.message_text()))
                    .unwrap_or_else(|| (r.status.clone(), String::new()));
                TaskAddFailure {
                    task_id: r.task_id,
                    code,
                    message,
                }
            })
            .collect())
    }
}

fn error_from_response(status: StatusCode, body: &str, url: &Url) -> BatchError {
    let parsed = serde_json::from_str::<ServiceErrorBody>(body).ok();
    let code = parsed
        .as_ref()
        .map(|b| b.code.clone())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| status.as_u16().to_string());
    let message = parsed
        .as_ref()
        .map(ServiceErrorBody::message_text)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BatchError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        StatusCode::NOT_FOUND => BatchError::NotFound {
            resource: url.path().to_string(),
        },
        _ => BatchError::ServiceError {
            status: status.as_u16(),
            code,
            message,
        },
    }
}

#[async_trait]
impl BatchService for BatchClient {
    async fn create_job(&self, job: &JobSpec) -> Result<(), BatchError> {
        let url = self.url(&["jobs"])?;
        let body = serde_json::to_string(job).map_err(|e| BatchError::Serialization {
            message: e.to_string(),
        })?;

        self.send(Method::POST, url, Some(body)).await?;
        info!(job_id = %job.id, "Created batch job");
        Ok(())
    }

    async fn add_tasks(
        &self,
        job_id: &str,
        tasks: Vec<TaskSpec>,
        max_parallelism: usize,
    ) -> Result<(), BatchError> {
        let total = tasks.len();
        let chunks: Vec<&[TaskSpec]> = tasks.chunks(MAX_TASKS_PER_REQUEST).collect();
        let requests: Vec<_> = chunks
            .into_iter()
            .map(|chunk| self.add_task_chunk(job_id, chunk))
            .collect();
        let results: Vec<Result<Vec<TaskAddFailure>, BatchError>> = stream::iter(requests)
            .buffer_unordered(max_parallelism.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        for result in results {
            failures.extend(result?);
        }

        if !failures.is_empty() {
            warn!(
                job_id,
                failed = failures.len(),
                total,
                "Some tasks were rejected"
            );
            return Err(BatchError::TaskAddFailed { failures });
        }

        info!(job_id, total, "Added tasks to batch job");
        Ok(())
    }

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<TaskInfo>, BatchError> {
        let mut tasks = Vec::new();
        let mut next = Some(self.url(&["jobs", job_id, "tasks"])?);

        while let Some(url) = next.take() {
            let response = self.send(Method::GET, url, None).await?;
            let page: TaskListPage =
                serde_json::from_str(&response.body).map_err(|e| BatchError::Serialization {
                    message: format!("task list: {}", e),
                })?;
            tasks.extend(page.value);

            if let Some(link) = page.next_link {
                let mut url = Url::parse(&link).map_err(|e| BatchError::Serialization {
                    message: format!("next link: {}", e),
                })?;
                if !url.query_pairs().any(|(k, _)| k == "api-version") {
                    url.query_pairs_mut()
                        .append_pair("api-version", &self.config.api_version);
                }
                next = Some(url);
            }
        }

        Ok(tasks)
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BatchError> {
        let url = self.url(&["jobs", job_id])?;
        let response = self.send(Method::DELETE, url, None).await?;
        debug!(
            job_id,
            status = response.status.as_u16(),
            "Deleted batch job"
        );
        Ok(())
    }

    async fn read_task_output(&self, job_id: &str, task_id: &str) -> Result<String, BatchError> {
        let url = self.url(&["jobs", job_id, "tasks", task_id, "files", STANDARD_OUT_FILE])?;
        let response = self.send(Method::GET, url, None).await?;
        Ok(response.body)
    }
}
