//! Tests for configuration types.

use super::*;

// ============================================================================
// Default Tests
// ============================================================================

mod defaults {
    use super::*;

    /// Verify that an empty document yields the documented defaults.
    #[test]
    fn test_empty_document_uses_defaults() {
        let config: SleeperConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.queue.name, "sleeper");
        assert_eq!(config.producer.sender_count, 1);
        assert_eq!(config.consumer.visibility_timeout_seconds, 40);
        assert_eq!(config.consumer.drain_policy, DrainPolicy::Coordinated);
        assert_eq!(config.consumer.malformed_policy, MalformedPolicy::Delete);
        assert_eq!(config.consumer.max_delivery_count, None);
        assert_eq!(config.job.completion_timeout_seconds, 1200);
        assert!(config.monitor.job_id.is_none());
    }

    /// Verify that a partial section keeps defaults for the missing fields.
    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: SleeperConfig = serde_json::from_str(
            r#"{"consumer": {"workers": 4, "drain_policy": "per-worker"}}"#,
        )
        .unwrap();

        assert_eq!(config.consumer.workers, Some(4));
        assert_eq!(config.consumer.drain_policy, DrainPolicy::PerWorker);
        assert_eq!(config.consumer.visibility_timeout_seconds, 40);
        assert_eq!(config.consumer.poison_queue_suffix, "poison");
    }

    #[test]
    fn test_default_configs_validate() {
        assert!(ConsumerConfig::default().validate().is_ok());
        assert!(ProducerConfig::default().validate().is_ok());
        assert!(JobSettings::default().validate().is_ok());
    }

    #[test]
    fn test_pool_size_defaults_to_parallelism() {
        let config = ConsumerConfig::default();

        assert!(config.pool_size() >= 1);
        assert_eq!(config.with_workers(3).pool_size(), 3);
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_zero_workers_rejected() {
        let config = ConsumerConfig::default().with_workers(0);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "workers"
        ));
    }

    /// Verify that the visibility timeout must fit the service range.
    #[test]
    fn test_visibility_timeout_range() {
        let zero = ConsumerConfig::default().with_visibility_timeout_seconds(0);
        let too_long = ConsumerConfig::default().with_visibility_timeout_seconds(8 * 24 * 3600);
        let max = ConsumerConfig::default().with_visibility_timeout_seconds(7 * 24 * 3600);

        assert!(zero.validate().is_err());
        assert!(too_long.validate().is_err());
        assert!(max.validate().is_ok());
    }

    /// Verify that the renewal interval must be shorter than the lease.
    #[test]
    fn test_renewal_interval_must_be_shorter_than_lease() {
        let mut config = ConsumerConfig::default().with_visibility_timeout_seconds(10);
        config.lease_renewal_interval_seconds = Some(10);
        assert!(config.validate().is_err());

        config.lease_renewal_interval_seconds = Some(5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_senders_rejected() {
        let config = ProducerConfig {
            sender_count: 0,
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_monitor_requires_job_id() {
        let mut config = MonitorConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing { .. })));

        config.job_id = Some("job-1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_account_requires_all_fields() {
        let mut account = AccountSettings {
            batch_account_name: "acct".to_string(),
            batch_account_key: Secret::new("a2V5"),
            batch_account_url: String::new(),
            storage_connection_string: Secret::default(),
        };
        assert!(matches!(
            account.validate_batch(),
            Err(ConfigError::Missing { ref field }) if field == "batch_account_url"
        ));

        account.batch_account_url = "https://acct.westus.batch.azure.com".to_string();
        assert!(account.validate_batch().is_ok());
    }
}

// ============================================================================
// Policy and Secret Tests
// ============================================================================

mod policies {
    use super::*;

    #[test]
    fn test_drain_policy_from_str() {
        assert_eq!("coordinated".parse::<DrainPolicy>().unwrap(), DrainPolicy::Coordinated);
        assert_eq!("per-worker".parse::<DrainPolicy>().unwrap(), DrainPolicy::PerWorker);
        assert!("sometimes".parse::<DrainPolicy>().is_err());
    }

    #[test]
    fn test_malformed_policy_deserializes_kebab_case() {
        let policy: MalformedPolicy = serde_json::from_str(r#""dead-letter""#).unwrap();

        assert_eq!(policy, MalformedPolicy::DeadLetter);
    }

    /// Verify that secrets never appear in debug output.
    #[test]
    fn test_account_settings_debug_redacts_secrets() {
        let account: AccountSettings = serde_json::from_str(
            r#"{"batch_account_name": "acct", "batch_account_key": "super-secret",
                "storage_connection_string": "AccountKey=also-secret"}"#,
        )
        .unwrap();

        let rendered = format!("{:?}", account);

        assert!(rendered.contains("acct"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("also-secret"));
        assert_eq!(account.batch_account_key.expose(), "super-secret");
    }

    #[test]
    fn test_empty_secret_debug() {
        assert_eq!(format!("{:?}", Secret::default()), "<empty>");
    }
}
