//! Tests for the batch REST client.

use super::*;
use crate::models::{PoolInformation, TaskState};
use serde_json::json;
use wiremock::matchers::{
    body_partial_json, header, header_exists, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

fn client_for(server: &MockServer) -> BatchClient {
    let credentials = BatchCredentials::new(&server.uri(), "acct", KEY).unwrap();
    let config = BatchClientConfig::default().with_initial_retry_delay(Duration::from_millis(1));
    BatchClient::new(credentials, config).unwrap()
}

fn tasks(count: usize) -> Vec<TaskSpec> {
    (0..count)
        .map(|i| TaskSpec::new(format!("sleeper-{}", i), "sleeper-queue consume"))
        .collect()
}

fn task_page(states: &[(&str, &str)]) -> serde_json::Value {
    json!({
        "value": states
            .iter()
            .map(|(id, state)| json!({"id": id, "state": state}))
            .collect::<Vec<_>>()
    })
}

// ============================================================================
// Job Tests
// ============================================================================

mod jobs {
    use super::*;

    /// Verify that job creation posts the job with auth and version headers.
    #[tokio::test]
    async fn test_create_job() {
        // Arrange
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .and(query_param("api-version", "2023-05-01.17.0"))
            .and(header_exists("authorization"))
            .and(header_exists("ocp-date"))
            .and(header("content-type", JSON_CONTENT_TYPE))
            .and(body_partial_json(
                json!({"id": "job-1", "poolInfo": {"poolId": "pool-a"}}),
            ))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server);
        let job = JobSpec {
            id: "job-1".to_string(),
            pool_info: PoolInformation::existing("pool-a"),
            common_environment_settings: Vec::new(),
        };

        // Act
        let result = client.create_job(&job).await;

        // Assert
        assert!(result.is_ok());
    }

    /// Verify that a duplicate job is a permanent service error.
    #[tokio::test]
    async fn test_create_job_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "JobExists",
                "message": {"lang": "en-US", "value": "The specified job already exists."}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server);
        let job = JobSpec {
            id: "job-1".to_string(),
            pool_info: PoolInformation::existing("pool-a"),
            common_environment_settings: Vec::new(),
        };

        let error = client.create_job(&job).await.unwrap_err();

        match error {
            BatchError::ServiceError {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 409);
                assert_eq!(code, "JobExists");
                assert_eq!(message, "The specified job already exists.");
            }
            other => panic!("Expected ServiceError, got: {:?}", other),
        }
    }

    /// Verify that deleting a job issues a DELETE on the job path.
    #[tokio::test]
    async fn test_delete_job() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/jobs/job-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server);

        client.delete_job("job-1").await.unwrap();
    }

    /// Verify that a missing job maps to NotFound.
    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = client_for(&server);

        let error = client.delete_job("missing").await.unwrap_err();

        assert!(
            matches!(error, BatchError::NotFound { ref resource } if resource == "/jobs/missing")
        );
    }
}

// ============================================================================
// Task Tests
// ============================================================================

mod task_operations {
    use super::*;

    /// Verify that tasks are sent in collections of at most one hundred.
    #[tokio::test]
    async fn test_add_tasks_chunks_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/job-1/addtaskcollection"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(3)
            .mount(&server)
            .await;
        let client = client_for(&server);

        client.add_tasks("job-1", tasks(250), 2).await.unwrap();
    }

    /// Verify that rejected tasks are reported together.
    #[tokio::test]
    async fn test_add_tasks_reports_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/job-1/addtaskcollection"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"status": "success", "taskId": "sleeper-0"},
                    {"status": "clientError", "taskId": "sleeper-1",
                     "error": {"code": "TaskExists", "message": {"value": "exists"}}}
                ]
            })))
            .mount(&server)
            .await;
        let client = client_for(&server);

        let error = client.add_tasks("job-1", tasks(2), 1).await.unwrap_err();

        match error {
            BatchError::TaskAddFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].task_id, "sleeper-1");
                assert_eq!(failures[0].code, "TaskExists");
            }
            other => panic!("Expected TaskAddFailed, got: {:?}", other),
        }
    }

    /// Verify that task listing follows continuation links.
    #[tokio::test]
    async fn test_list_tasks_follows_next_link() {
        // Arrange
        let server = MockServer::start().await;
        let mut first = task_page(&[("t-0", "completed")]);
        first["odata.nextLink"] = json!(format!(
            "{}/jobs/job-1/tasks?api-version=2023-05-01.17.0&$skiptoken=2",
            server.uri()
        ));
        Mock::given(method("GET"))
            .and(path("/jobs/job-1/tasks"))
            .and(query_param_is_missing("$skiptoken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/job-1/tasks"))
            .and(query_param("$skiptoken", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(task_page(&[("t-1", "running")])),
            )
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server);

        // Act
        let listed = client.list_tasks("job-1").await.unwrap();

        // Assert
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "t-0");
        assert_eq!(listed[1].state, TaskState::Running);
    }

    /// Verify that task output is read from the stdout file.
    #[tokio::test]
    async fn test_read_task_output() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/job-1/tasks/t-0/files/stdout.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Sleeping for 3 seconds\n"))
            .mount(&server)
            .await;
        let client = client_for(&server);

        let output = client.read_task_output("job-1", "t-0").await.unwrap();

        assert_eq!(output, "Sleeping for 3 seconds\n");
    }
}

// ============================================================================
// Completion and Retry Tests
// ============================================================================

mod completion {
    use super::*;

    /// Verify that waiting returns once every task is completed.
    #[tokio::test]
    async fn test_wait_for_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/job-1/tasks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(task_page(&[("t-0", "completed"), ("t-1", "running")])),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/job-1/tasks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(task_page(&[("t-0", "completed"), ("t-1", "completed")])),
            )
            .mount(&server)
            .await;
        let client = client_for(&server);

        let done = client
            .wait_for_completion("job-1", Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(done.len(), 2);
        assert!(done.iter().all(TaskInfo::is_completed));
    }

    /// Verify that waiting gives up at the deadline.
    #[tokio::test]
    async fn test_wait_for_completion_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_page(&[("t-0", "active")])))
            .mount(&server)
            .await;
        let client = client_for(&server);

        let error = client
            .wait_for_completion(
                "job-1",
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();

        assert!(
            matches!(error, BatchError::CompletionTimeout { ref job_id, .. } if job_id == "job-1")
        );
    }

    /// Verify that transient failures are retried.
    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let client = client_for(&server);

        client.delete_job("job-1").await.unwrap();
    }

    /// Verify that rejected credentials are not retried.
    #[tokio::test]
    async fn test_authentication_failure_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "AuthenticationFailed",
                "message": {"value": "Server failed to authenticate the request."}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let client = client_for(&server);

        let error = client.list_tasks("job-1").await.unwrap_err();

        assert!(matches!(error, BatchError::AuthenticationFailed { .. }));
    }
}
