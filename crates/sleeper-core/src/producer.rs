//! Work item producer with fan-out across concurrent senders.

use crate::codec::{CodecError, Payload};
use crate::config::{ConfigError, ProducerConfig};
use queue_runtime::{Message, QueueClient, QueueError, QueueName};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Outcome of a completed produce run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceReport {
    pub items_sent: usize,
    pub sender_count: usize,
    pub elapsed: Duration,

    /// Whether the queue had to be created
    pub queue_created: bool,
}

/// Errors that stop a produce run
#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("Invalid producer configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Payload cannot be encoded: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to create queue '{queue}': {source}")]
    CreateQueue {
        queue: String,
        #[source]
        source: QueueError,
    },

    /// Items already sent stay in the queue
    #[error("Send failed after {sent} items were enqueued: {source}")]
    Send {
        sent: usize,
        #[source]
        source: QueueError,
    },

    #[error("Sender task failed after {sent} items were enqueued: {message}")]
    SenderFailed { sent: usize, message: String },
}

impl ProduceError {
    /// Number of items that reached the queue before the failure
    pub fn items_sent(&self) -> usize {
        match self {
            Self::Send { sent, .. } | Self::SenderFailed { sent, .. } => *sent,
            _ => 0,
        }
    }

    /// Check if the underlying transport failure was transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CreateQueue { source, .. } | Self::Send { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Split `count` items across `senders`; the first `count % senders` get one extra
pub fn split_count(count: usize, senders: usize) -> Vec<usize> {
    let senders = senders.max(1);
    let base = count / senders;
    let remainder = count % senders;
    (0..senders)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

/// Enqueues copies of a payload through a shared queue client
pub struct Producer {
    client: Arc<dyn QueueClient>,
    queue: QueueName,
    config: ProducerConfig,
}

impl Producer {
    /// Create a producer for `queue`
    ///
    /// # Errors
    ///
    /// Returns `ProduceError::Configuration` if the sender count is zero.
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue: QueueName,
        config: ProducerConfig,
    ) -> Result<Self, ProduceError> {
        config.validate()?;
        Ok(Self {
            client,
            queue,
            config,
        })
    }

    /// Enqueue `count` items built from `payload`
    ///
    /// The queue is created if absent before the first send. Senders run as
    /// separate tasks; if any of them exhausts the transport's retries the
    /// first such failure is returned with the total number of items sent.
    pub async fn produce<P: Payload>(
        &self,
        count: usize,
        payload: &P,
    ) -> Result<ProduceReport, ProduceError> {
        let body = payload.encode()?;
        let sender_count = self.config.sender_count;
        let started = Instant::now();

        info!(
            queue = %self.queue,
            count,
            senders = sender_count,
            payload = %body,
            "Producing messages"
        );

        let queue_created = self
            .client
            .create_queue_if_absent(&self.queue)
            .await
            .map_err(|source| ProduceError::CreateQueue {
                queue: self.queue.to_string(),
                source,
            })?;
        if queue_created {
            info!(queue = %self.queue, "The queue was created");
        }

        let sent = Arc::new(AtomicUsize::new(0));
        let mut senders = JoinSet::new();
        for (sender, share) in split_count(count, sender_count).into_iter().enumerate() {
            let client = Arc::clone(&self.client);
            let queue = self.queue.clone();
            let mut message = Message::new(body.clone());
            if let Some(ttl) = self.config.message_ttl() {
                message = message.with_ttl(ttl);
            }
            let sent = Arc::clone(&sent);

            senders.spawn(async move {
                for _ in 0..share {
                    client.send_message(&queue, message.clone()).await?;
                    sent.fetch_add(1, Ordering::SeqCst);
                }
                debug!(sender, items = share, "Sender finished");
                Ok::<(), QueueError>(())
            });
        }

        let mut first_failure: Option<Result<QueueError, String>> = None;
        while let Some(joined) = senders.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(queue_error)) => Ok(queue_error),
                Err(join_error) => Err(join_error.to_string()),
            };
            if first_failure.is_none() {
                first_failure = Some(failure);
            }
        }

        let items_sent = sent.load(Ordering::SeqCst);
        match first_failure {
            None => {
                let elapsed = started.elapsed();
                info!(
                    queue = %self.queue,
                    items_sent,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "All tasks are done with sending messages"
                );
                Ok(ProduceReport {
                    items_sent,
                    sender_count,
                    elapsed,
                    queue_created,
                })
            }
            Some(Ok(source)) => {
                error!(queue = %self.queue, items_sent, error = %source, "Producing failed");
                Err(ProduceError::Send {
                    sent: items_sent,
                    source,
                })
            }
            Some(Err(message)) => {
                error!(queue = %self.queue, items_sent, error = %message, "Sender task failed");
                Err(ProduceError::SenderFailed {
                    sent: items_sent,
                    message,
                })
            }
        }
    }
}
