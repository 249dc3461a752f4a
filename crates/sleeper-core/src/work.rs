//! Units of work run by the lease loop.

use crate::codec::{CodecError, Payload, SleepPayload};
use async_trait::async_trait;
use queue_runtime::MessageId;
use thiserror::Error;
use tracing::info;

#[cfg(test)]
#[path = "work_tests.rs"]
mod tests;

/// Errors returned by a unit of work
#[derive(Debug, Error)]
pub enum WorkError {
    /// The item can never be processed; it is not redelivered
    #[error(transparent)]
    Malformed(#[from] CodecError),

    /// Processing failed this time; the item is redelivered
    #[error("Work failed: {message}")]
    Failed { message: String },
}

impl WorkError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// The item handed to a unit of work
#[derive(Debug, Clone, Copy)]
pub struct WorkContext<'a> {
    pub message_id: &'a MessageId,
    pub body: &'a str,
    pub delivery_count: u32,
    pub worker_id: usize,
}

/// Processing applied to every leased item
///
/// Items are delivered at least once, so implementations must tolerate being
/// run more than once for the same message id.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn run(&self, item: WorkContext<'_>) -> Result<(), WorkError>;
}

/// Sleeps for the number of seconds carried by the item
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepWork;

#[async_trait]
impl WorkUnit for SleepWork {
    async fn run(&self, item: WorkContext<'_>) -> Result<(), WorkError> {
        let payload = SleepPayload::decode(item.body)?;

        info!(
            worker = item.worker_id,
            message_id = %item.message_id,
            seconds = payload.seconds(),
            "Sleeping for {} seconds",
            payload.seconds()
        );
        tokio::time::sleep(payload.duration()).await;

        Ok(())
    }
}
