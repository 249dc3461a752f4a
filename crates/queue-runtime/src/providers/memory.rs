//! In-memory queue provider implementation for testing and development.
//!
//! This module provides a fully functional in-memory queue that:
//! - Hides leased messages for their visibility timeout and redelivers them
//!   once the lease lapses
//! - Issues a fresh pop receipt on every delivery so stale receipts are rejected
//! - Enforces message TTL and size limits
//! - Provides thread-safe concurrent access
//!
//! Lease deadlines are measured with [`tokio::time::Instant`], so tests running
//! with a paused clock can drive lease expiry deterministically.
//!
//! Unlike the storage service, [`QueueProvider::approximate_message_count`]
//! here counts only messages that are currently visible.

use crate::client::QueueProvider;
use crate::error::{QueueError, ValidationError};
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::provider::{InMemoryConfig, ProviderType};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all queues
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    config: InMemoryConfig,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            config,
        }
    }

    fn queue_mut(&mut self, queue_name: &QueueName) -> Result<&mut InMemoryQueue, QueueError> {
        self.queues
            .get_mut(queue_name)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: queue_name.to_string(),
            })
    }
}

/// Internal queue state for a single queue, in enqueue order
#[derive(Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
}

impl InMemoryQueue {
    fn purge_expired(&mut self, now: Instant) {
        self.messages.retain(|m| !m.is_expired(now));
    }

    fn find_leased(
        &mut self,
        receipt: &ReceiptHandle,
        now: Instant,
    ) -> Result<usize, QueueError> {
        let lost = || QueueError::MessageNotFound {
            receipt: receipt.to_string(),
        };

        let index = self
            .messages
            .iter()
            .position(|m| &m.message_id == receipt.message_id())
            .ok_or_else(lost)?;

        let stored = &self.messages[index];
        let holds_lease =
            stored.pop_receipt.as_deref() == Some(receipt.handle()) && now < stored.visible_at;

        if holds_lease {
            Ok(index)
        } else {
            Err(lost())
        }
    }
}

/// A message stored in the queue with lease metadata
struct StoredMessage {
    message_id: MessageId,
    body: String,
    inserted_at: Timestamp,
    delivery_count: u32,
    visible_at: Instant,
    expires_at: Option<Instant>,
    pop_receipt: Option<String>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }
}

fn to_std(field: &str, duration: Duration) -> Result<std::time::Duration, QueueError> {
    duration.to_std().map_err(|_| {
        QueueError::ValidationError(ValidationError::OutOfRange {
            field: field.to_string(),
            message: "must not be negative".to_string(),
        })
    })
}

fn new_pop_receipt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// InMemoryProvider
// ============================================================================

/// In-memory queue provider implementation
///
/// Cloning the provider yields another handle onto the same storage, which
/// lets tests inspect queue state while workers use the client.
#[derive(Clone)]
pub struct InMemoryProvider {
    storage: Arc<Mutex<QueueStorage>>,
}

impl InMemoryProvider {
    /// Create new in-memory provider with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(QueueStorage::new(config))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueStorage> {
        // A panic while holding the lock cannot leave a queue half-updated
        self.storage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Total messages stored in a queue, leased or not
    pub fn total_messages(&self, queue: &QueueName) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().filter(|m| !m.is_expired(now)).count())
            .unwrap_or(0)
    }

    /// Messages currently hidden by a live lease
    pub fn leased_messages(&self, queue: &QueueName) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .filter(|m| !m.is_expired(now) && !m.is_visible(now))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Whether a queue exists
    pub fn queue_exists(&self, queue: &QueueName) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Bodies of all stored messages in enqueue order
    pub fn message_bodies(&self, queue: &QueueName) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl QueueProvider for InMemoryProvider {
    async fn create_queue_if_absent(&self, queue: &QueueName) -> Result<bool, QueueError> {
        let mut storage = self.lock();
        if storage.queues.contains_key(queue) {
            return Ok(false);
        }

        storage.queues.insert(queue.clone(), InMemoryQueue::default());
        Ok(true)
    }

    async fn send_message(
        &self,
        queue: &QueueName,
        message: &Message,
    ) -> Result<MessageId, QueueError> {
        let now = Instant::now();
        let mut storage = self.lock();
        let max_message_size = storage.config.max_message_size;
        let max_queue_size = storage.config.max_queue_size;
        let ttl = message
            .time_to_live
            .or(storage.config.default_message_ttl)
            .map(|ttl| to_std("time_to_live", ttl))
            .transpose()?;

        if message.size() > max_message_size {
            return Err(QueueError::MessageTooLarge {
                size: message.size(),
                max_size: max_message_size,
            });
        }

        let target = storage.queue_mut(queue)?;
        target.purge_expired(now);
        if target.messages.len() >= max_queue_size {
            return Err(QueueError::ProviderError {
                provider: ProviderType::InMemory.to_string(),
                code: "QueueFull".to_string(),
                message: format!("queue '{}' holds {} messages", queue, max_queue_size),
            });
        }

        let message_id = MessageId::new();
        target.messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: message.body.clone(),
            inserted_at: Timestamp::now(),
            delivery_count: 0,
            visible_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            pop_receipt: None,
        });

        Ok(message_id)
    }

    async fn approximate_message_count(&self, queue: &QueueName) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut storage = self.lock();
        let target = storage.queue_mut(queue)?;
        target.purge_expired(now);

        Ok(target.messages.iter().filter(|m| m.is_visible(now)).count() as u64)
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let lease = to_std("visibility_timeout", visibility_timeout)?;
        let now = Instant::now();
        let mut storage = self.lock();
        let target = storage.queue_mut(queue)?;
        target.purge_expired(now);

        let Some(stored) = target.messages.iter_mut().find(|m| m.is_visible(now)) else {
            return Ok(None);
        };

        let pop_receipt = new_pop_receipt();
        stored.pop_receipt = Some(pop_receipt.clone());
        stored.visible_at = now + lease;
        stored.delivery_count += 1;

        Ok(Some(ReceivedMessage {
            message_id: stored.message_id.clone(),
            body: stored.body.clone(),
            receipt_handle: ReceiptHandle::new(
                stored.message_id.clone(),
                pop_receipt,
                Timestamp::after(visibility_timeout),
                ProviderType::InMemory,
            ),
            delivery_count: stored.delivery_count,
            inserted_at: stored.inserted_at.clone(),
            delivered_at: Timestamp::now(),
        }))
    }

    async fn delete_message(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut storage = self.lock();
        let target = storage.queue_mut(queue)?;
        let index = target.find_leased(receipt, now)?;
        target.messages.remove(index);
        Ok(())
    }

    async fn update_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        let lease = to_std("visibility_timeout", visibility_timeout)?;
        let now = Instant::now();
        let mut storage = self.lock();
        let target = storage.queue_mut(queue)?;
        let index = target.find_leased(receipt, now)?;

        let stored = &mut target.messages[index];
        let pop_receipt = new_pop_receipt();
        stored.pop_receipt = Some(pop_receipt.clone());
        stored.visible_at = now + lease;

        Ok(ReceiptHandle::new(
            stored.message_id.clone(),
            pop_receipt,
            Timestamp::after(visibility_timeout),
            ProviderType::InMemory,
        ))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }

    fn max_message_size(&self) -> usize {
        self.lock().config.max_message_size
    }
}
