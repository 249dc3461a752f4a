//! Tests for batch job submission.

use super::*;
use crate::test_support::{BatchCall, FakeBatch};
use chrono::TimeZone;
use std::sync::atomic::Ordering;

fn settings() -> JobSettings {
    JobSettings {
        task_count: 3,
        max_degree_of_parallelism: 2,
        ..JobSettings::default()
    }
}

fn submitter(batch: Arc<FakeBatch>, settings: JobSettings) -> JobSubmitter {
    JobSubmitter::new(batch, settings, Secret::new("UseDevelopmentStorage=true")).unwrap()
}

// ============================================================================
// Job Construction
// ============================================================================

mod construction {
    use super::*;

    #[test]
    fn test_job_id_includes_user_and_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let id = create_job_id("SleeperJob", "alice", now);

        assert_eq!(id, "SleeperJob-alice-20240309-140507");
    }

    /// Verify that the job runs on an auto-pool scoped to the job's lifetime.
    #[test]
    fn test_job_uses_auto_pool_with_job_lifetime() {
        // Arrange
        let settings = JobSettings {
            pool_target_node_count: 4,
            pool_keep_alive: true,
            application_version: Some("1.2".to_string()),
            ..JobSettings::default()
        };

        // Act
        let job = build_job("job-1", &settings, &Secret::new("conn"));

        // Assert
        assert_eq!(job.id, "job-1");
        assert!(job.pool_info.pool_id.is_none());
        let auto = job.pool_info.auto_pool_specification.unwrap();
        assert_eq!(auto.auto_pool_id_prefix, "sleeper");
        assert_eq!(auto.pool_lifetime_option, PoolLifetimeOption::Job);
        assert!(auto.keep_alive);
        assert_eq!(auto.pool.target_dedicated_nodes, 4);
        assert_eq!(auto.pool.vm_size, "STANDARD_D2S_V3");
        assert_eq!(auto.pool.task_scheduling_policy.node_fill_type, NodeFillType::Spread);
        assert_eq!(
            auto.pool.virtual_machine_configuration.image_reference.offer,
            "UbuntuServer"
        );
        assert_eq!(
            auto.pool.application_package_references,
            vec![ApplicationPackageReference {
                application_id: "sleeper".to_string(),
                version: Some("1.2".to_string()),
            }]
        );
    }

    /// Verify that tasks receive the storage connection string.
    #[test]
    fn test_job_exports_storage_connection() {
        let job = build_job("job-1", &JobSettings::default(), &Secret::new("conn"));

        assert_eq!(
            job.common_environment_settings,
            vec![EnvironmentSetting::new(STORAGE_CONNECTION_ENV, "conn")]
        );
    }

    #[test]
    fn test_job_omits_empty_storage_connection() {
        let job = build_job("job-1", &JobSettings::default(), &Secret::default());

        assert!(job.common_environment_settings.is_empty());
    }

    #[test]
    fn test_tasks_named_after_application() {
        let tasks = build_tasks(&settings());

        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["sleeper-0", "sleeper-1", "sleeper-2"]);
        assert!(tasks
            .iter()
            .all(|t| t.command_line == JobSettings::default().task_command));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = JobSettings {
            task_count: 0,
            ..JobSettings::default()
        };

        let result = JobSubmitter::new(Arc::new(FakeBatch::default()), settings, Secret::default());

        assert!(matches!(result, Err(SubmitError::Configuration(_))));
    }
}

// ============================================================================
// Submission Flow
// ============================================================================

mod flow {
    use super::*;

    /// Verify the full create, add, wait, read and delete sequence.
    #[tokio::test(start_paused = true)]
    async fn test_submit_runs_job_to_completion() {
        // Arrange
        let batch = Arc::new(FakeBatch::default());

        // Act
        let report = submitter(batch.clone(), settings())
            .submit_as("job-1")
            .await
            .unwrap();

        // Assert
        assert_eq!(report.job_id, "job-1");
        assert!(report.job_deleted);
        assert_eq!(report.outputs.len(), 3);
        assert_eq!(report.outputs[0].stdout, "output of sleeper-0");
        assert_eq!(report.outputs[0].exit_code, Some(0));

        let calls = batch.calls();
        assert_eq!(calls[0], BatchCall::CreateJob("job-1".to_string()));
        assert_eq!(
            calls[1],
            BatchCall::AddTasks {
                job_id: "job-1".to_string(),
                task_ids: vec![
                    "sleeper-0".to_string(),
                    "sleeper-1".to_string(),
                    "sleeper-2".to_string()
                ],
                max_parallelism: 2,
            }
        );
        assert_eq!(calls.last(), Some(&BatchCall::DeleteJob("job-1".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generated_job_id_uses_prefix_and_user() {
        let batch = Arc::new(FakeBatch::default());

        let report = submitter(batch, settings()).submit("bob").await.unwrap();

        assert!(report.job_id.starts_with("SleeperJob-bob-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kept_alive_job_not_deleted() {
        let batch = Arc::new(FakeBatch::default());
        let settings = JobSettings {
            job_keep_alive: true,
            ..settings()
        };

        let report = submitter(batch.clone(), settings).submit_as("job-1").await.unwrap();

        assert!(!report.job_deleted);
        assert!(!batch
            .calls()
            .iter()
            .any(|c| matches!(c, BatchCall::DeleteJob(_))));
    }

    /// Verify that the job is still deleted when adding tasks fails.
    #[tokio::test(start_paused = true)]
    async fn test_failed_submission_still_deletes_job() {
        // Arrange
        let batch = Arc::new(FakeBatch::default());
        batch.fail_add.store(true, Ordering::SeqCst);

        // Act
        let error = submitter(batch.clone(), settings())
            .submit_as("job-1")
            .await
            .unwrap_err();

        // Assert
        assert!(matches!(
            error,
            SubmitError::Batch {
                operation: "add_tasks",
                ..
            }
        ));
        assert_eq!(batch.calls().last(), Some(&BatchCall::DeleteJob("job-1".to_string())));
    }

    /// Verify that the original failure wins over a failing cleanup.
    #[tokio::test(start_paused = true)]
    async fn test_first_failure_reported_when_delete_also_fails() {
        let batch = Arc::new(FakeBatch::default());
        batch.fail_create.store(true, Ordering::SeqCst);
        batch.fail_delete.store(true, Ordering::SeqCst);

        let error = submitter(batch, settings()).submit_as("job-1").await.unwrap_err();

        assert!(matches!(
            error,
            SubmitError::Batch {
                operation: "create_job",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_after_success_is_reported() {
        let batch = Arc::new(FakeBatch::default());
        batch.fail_delete.store(true, Ordering::SeqCst);

        let error = submitter(batch, settings()).submit_as("job-1").await.unwrap_err();

        assert!(matches!(
            error,
            SubmitError::Batch {
                operation: "delete_job",
                ..
            }
        ));
    }

    /// Verify that tasks still running at the deadline produce a timeout.
    #[tokio::test(start_paused = true)]
    async fn test_completion_timeout() {
        // Arrange
        let batch = Arc::new(FakeBatch::default());
        batch.never_complete.store(true, Ordering::SeqCst);
        let settings = JobSettings {
            completion_timeout_seconds: 30,
            completion_poll_interval_seconds: 10,
            ..settings()
        };

        // Act
        let error = submitter(batch.clone(), settings)
            .submit_as("job-1")
            .await
            .unwrap_err();

        // Assert
        match error {
            SubmitError::Batch {
                operation: "wait_for_completion",
                source: BatchError::CompletionTimeout { job_id, .. },
                ..
            } => assert_eq!(job_id, "job-1"),
            other => panic!("Expected CompletionTimeout, got: {:?}", other),
        }
        let polls = batch
            .calls()
            .iter()
            .filter(|c| matches!(c, BatchCall::ListTasks(_)))
            .count();
        assert_eq!(polls, 4);
    }
}
