//! Tests for batch error classification.

use super::*;

#[test]
fn test_server_errors_are_transient() {
    let busy = BatchError::ServiceError {
        status: 503,
        code: "ServerBusy".to_string(),
        message: "busy".to_string(),
    };
    let throttled = BatchError::ServiceError {
        status: 429,
        code: "TooManyRequests".to_string(),
        message: "slow down".to_string(),
    };

    assert!(busy.is_transient());
    assert!(throttled.is_transient());
}

#[test]
fn test_client_errors_are_permanent() {
    let conflict = BatchError::ServiceError {
        status: 409,
        code: "JobExists".to_string(),
        message: "exists".to_string(),
    };

    assert!(!conflict.is_transient());
    assert!(!BatchError::AuthenticationFailed {
        message: "bad key".to_string()
    }
    .is_transient());
    assert!(!BatchError::NotFound {
        resource: "jobs/x".to_string()
    }
    .is_transient());
}

#[test]
fn test_task_add_failure_message_counts_failures() {
    let error = BatchError::TaskAddFailed {
        failures: vec![
            TaskAddFailure {
                task_id: "a".to_string(),
                code: "TaskExists".to_string(),
                message: "exists".to_string(),
            },
            TaskAddFailure {
                task_id: "b".to_string(),
                code: "TaskExists".to_string(),
                message: "exists".to_string(),
            },
        ],
    };

    assert_eq!(error.to_string(), "2 task(s) could not be added");
}
