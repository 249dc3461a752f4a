//! Error types for batch service operations.

use std::time::Duration;
use thiserror::Error;

/// A task the service refused to add, with the reason it gave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAddFailure {
    pub task_id: String,
    pub code: String,
    pub message: String,
}

/// Errors returned by the batch service client
#[derive(Debug, Error)]
pub enum BatchError {
    /// Credentials were rejected (non-retryable).
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Network connectivity or transport error.
    #[error("Network error: {message}")]
    NetworkError { message: String },

    /// A single request exceeded the client timeout.
    #[error("Request timed out after {duration:?}")]
    RequestTimeout { duration: Duration },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// The service returned an error response not covered by another variant.
    #[error("Batch service error {status}: {code} - {message}")]
    ServiceError {
        status: u16,
        code: String,
        message: String,
    },

    /// Some tasks in a bulk add were rejected.
    #[error("{} task(s) could not be added", failures.len())]
    TaskAddFailed { failures: Vec<TaskAddFailure> },

    /// Tasks did not all complete before the wait deadline.
    #[error("Tasks in job '{job_id}' did not complete within {timeout:?}")]
    CompletionTimeout { job_id: String, timeout: Duration },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Unexpected response body: {message}")]
    Serialization { message: String },
}

impl BatchError {
    /// Check if this error represents a transient condition that may succeed if retried.
    ///
    /// Network failures, timeouts, throttling (429) and server errors (5xx)
    /// are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AuthenticationFailed { .. } => false,
            Self::NetworkError { .. } => true,
            Self::RequestTimeout { .. } => true,
            Self::NotFound { .. } => false,
            Self::ServiceError { status, .. } => *status >= 500 || *status == 429,
            Self::TaskAddFailed { .. } => false,
            Self::CompletionTimeout { .. } => false,
            Self::Configuration { .. } => false,
            Self::Serialization { .. } => false,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
