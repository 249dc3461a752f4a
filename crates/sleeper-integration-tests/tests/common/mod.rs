//! Common utilities for sleeper integration tests
//!
//! This module provides:
//! - An in-memory queue client sharing storage with an inspectable provider
//! - A recording work unit that counts runs per item
//! - Helpers for seeding queues

use async_trait::async_trait;
use queue_runtime::{
    InMemoryProvider, Message, MessageId, QueueClient, QueueName, RetryPolicy,
    StandardQueueClient,
};
use sleeper_core::{Payload, SleepPayload, WorkContext, WorkError, WorkUnit};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

/// In-memory client plus a handle onto the same storage
#[allow(dead_code)]
pub fn memory_queue() -> (Arc<dyn QueueClient>, InMemoryProvider) {
    let provider = InMemoryProvider::default();
    let client = StandardQueueClient::new(Box::new(provider.clone()), RetryPolicy::none());
    (Arc::new(client), provider)
}

#[allow(dead_code)]
pub async fn seed(client: &dyn QueueClient, queue: &QueueName, bodies: &[&str]) {
    client.create_queue_if_absent(queue).await.unwrap();
    for body in bodies {
        client
            .send_message(queue, Message::new(body.to_string()))
            .await
            .unwrap();
    }
}

// ============================================================================
// Recording Work Unit
// ============================================================================

/// Sleeps for the decoded payload and records every run
///
/// When `first_delivery` is set, first deliveries sleep that long instead of
/// the payload, which lets a test push work past the lease.
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingWork {
    runs: Mutex<HashMap<MessageId, usize>>,
    first_delivery: Option<Duration>,
}

#[allow(dead_code)]
impl RecordingWork {
    pub fn slow_first_delivery(duration: Duration) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            first_delivery: Some(duration),
        }
    }

    pub fn total_runs(&self) -> usize {
        self.runs.lock().unwrap().values().sum()
    }

    pub fn distinct_items(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkUnit for RecordingWork {
    async fn run(&self, item: WorkContext<'_>) -> Result<(), WorkError> {
        let payload = SleepPayload::decode(item.body)?;
        *self
            .runs
            .lock()
            .unwrap()
            .entry(item.message_id.clone())
            .or_insert(0) += 1;

        let duration = match self.first_delivery {
            Some(slow) if item.delivery_count == 1 => slow,
            Some(_) => Duration::ZERO,
            None => payload.duration(),
        };
        tokio::time::sleep(duration).await;
        Ok(())
    }
}
