//! Client traits and implementations for queue operations.

use crate::error::QueueError;
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::provider::{InMemoryConfig, ProviderConfig, ProviderType, QueueConfig};
use crate::providers::{AzureStorageQueueProvider, InMemoryProvider};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::Duration;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Main interface for queue operations across all providers
///
/// Every implementation offers at-least-once delivery: a received message stays
/// invisible for the requested visibility timeout and is redelivered unless it
/// is deleted with the receipt issued for that delivery.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Create the queue if it does not exist; returns true if it was created
    async fn create_queue_if_absent(&self, queue: &QueueName) -> Result<bool, QueueError>;

    /// Send single message to queue
    async fn send_message(&self, queue: &QueueName, message: Message)
        -> Result<MessageId, QueueError>;

    /// Approximate number of messages in the queue
    async fn approximate_message_count(&self, queue: &QueueName) -> Result<u64, QueueError>;

    /// Lease a single message, hiding it for `visibility_timeout`
    async fn receive_message(
        &self,
        queue: &QueueName,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Delete a leased message; fails with `MessageNotFound` if the receipt is stale
    async fn delete_message(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError>;

    /// Reset the visibility of a leased message, returning the new receipt
    ///
    /// A zero timeout makes the message visible again immediately (abandon).
    async fn update_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Interface implemented by specific queue providers (Azure Storage, in-memory)
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Create queue if absent
    async fn create_queue_if_absent(&self, queue: &QueueName) -> Result<bool, QueueError>;

    /// Send single message
    async fn send_message(
        &self,
        queue: &QueueName,
        message: &Message,
    ) -> Result<MessageId, QueueError>;

    /// Approximate message count
    async fn approximate_message_count(&self, queue: &QueueName) -> Result<u64, QueueError>;

    /// Receive single message under a lease
    async fn receive_message(
        &self,
        queue: &QueueName,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Delete leased message
    async fn delete_message(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError>;

    /// Update lease visibility
    async fn update_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;

    /// Maximum message body size in bytes
    fn max_message_size(&self) -> usize {
        self.provider_type().max_message_size()
    }
}

/// Factory for creating queue clients with appropriate providers
pub struct QueueClientFactory;

impl QueueClientFactory {
    /// Create queue client from configuration
    pub fn create_client(config: QueueConfig) -> Result<Arc<dyn QueueClient>, QueueError> {
        let retry_policy = RetryPolicy::from_config(&config);

        let provider: Box<dyn QueueProvider> = match config.provider {
            ProviderConfig::InMemory(in_memory_config) => {
                Box::new(InMemoryProvider::new(in_memory_config))
            }
            ProviderConfig::AzureStorage(azure_config) => Box::new(
                AzureStorageQueueProvider::new(azure_config, config.request_timeout)?,
            ),
        };

        Ok(Arc::new(StandardQueueClient::new(provider, retry_policy)))
    }

    /// Create test client with in-memory provider and no retries
    pub fn create_test_client() -> Arc<dyn QueueClient> {
        let provider = InMemoryProvider::new(InMemoryConfig::default());
        Arc::new(StandardQueueClient::new(
            Box::new(provider),
            RetryPolicy::none(),
        ))
    }
}

/// Standard queue client implementation
///
/// Validates outgoing messages against the provider limits and retries
/// transient provider failures according to its [`RetryPolicy`].
pub struct StandardQueueClient {
    provider: Box<dyn QueueProvider>,
    retry_policy: RetryPolicy,
}

impl StandardQueueClient {
    /// Create new standard queue client with provider
    pub fn new(provider: Box<dyn QueueProvider>, retry_policy: RetryPolicy) -> Self {
        Self {
            provider,
            retry_policy,
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.should_retry() && self.retry_policy.allows_retry(retry) => {
                    let delay = self.retry_policy.backoff(retry);
                    warn!(
                        operation,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient queue failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(error) => {
                    debug!(operation, error = %error, "Queue operation failed");
                    return Err(error);
                }
            }
        }
    }
}

#[async_trait]
impl QueueClient for StandardQueueClient {
    async fn create_queue_if_absent(&self, queue: &QueueName) -> Result<bool, QueueError> {
        self.with_retry("create_queue_if_absent", || {
            self.provider.create_queue_if_absent(queue)
        })
        .await
    }

    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        let max_size = self.provider.max_message_size();
        if message.size() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: message.size(),
                max_size,
            });
        }

        self.with_retry("send_message", || self.provider.send_message(queue, &message))
            .await
    }

    async fn approximate_message_count(&self, queue: &QueueName) -> Result<u64, QueueError> {
        self.with_retry("approximate_message_count", || {
            self.provider.approximate_message_count(queue)
        })
        .await
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        self.with_retry("receive_message", || {
            self.provider.receive_message(queue, visibility_timeout)
        })
        .await
    }

    async fn delete_message(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        self.with_retry("delete_message", || self.provider.delete_message(queue, receipt))
            .await
    }

    async fn update_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        self.with_retry("update_visibility", || {
            self.provider
                .update_visibility(queue, receipt, visibility_timeout)
        })
        .await
    }

    fn provider_type(&self) -> ProviderType {
        self.provider.provider_type()
    }
}
