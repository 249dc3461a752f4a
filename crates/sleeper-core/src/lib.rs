//! # Sleeper Core
//!
//! Queue-driven work distribution. A [`Producer`] fans items out over several
//! concurrent senders, a [`DrainCoordinator`] runs a pool of lease loops that
//! consume the queue until it is drained, and the batch flows submit consumer
//! jobs ([`JobSubmitter`]) or top them up while a backlog remains
//! ([`BacklogMonitor`]).
//!
//! Delivery is at-least-once: an item is acknowledged only after its unit of
//! work succeeds, and a lease that lapses mid-work makes the item visible to
//! another consumer.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use queue_runtime::{InMemoryProvider, QueueName, RetryPolicy, StandardQueueClient};
//! use sleeper_core::{ConsumerConfig, DrainCoordinator, Producer, ProducerConfig, SleepPayload, SleepWork};
//!
//! # tokio_test::block_on(async {
//! let client = Arc::new(StandardQueueClient::new(
//!     Box::new(InMemoryProvider::default()),
//!     RetryPolicy::none(),
//! ));
//! let queue = QueueName::new("sleeper".to_string()).unwrap();
//!
//! let producer = Producer::new(client.clone(), queue.clone(), ProducerConfig::default()).unwrap();
//! producer.produce(10, &SleepPayload::from_secs(0)).await.unwrap();
//!
//! let coordinator =
//!     DrainCoordinator::new(client, queue, ConsumerConfig::default(), Arc::new(SleepWork)).unwrap();
//! let report = coordinator.drain(4).await.unwrap();
//! assert_eq!(report.processed(), 10);
//! # });
//! ```

pub mod codec;
pub mod config;
pub mod dedup;
pub mod drain;
pub mod monitor;
pub mod producer;
pub mod submit;
pub mod work;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use codec::{CodecError, Payload, SleepPayload, WorkItem, MAX_PAYLOAD_BYTES};
pub use config::{
    AccountSettings, ConfigError, ConsumerConfig, DrainPolicy, JobSettings, MalformedPolicy,
    MonitorConfig, ProducerConfig, QueueSettings, Secret, SleeperConfig,
};
pub use dedup::DedupCache;
pub use drain::{DrainCoordinator, DrainError, DrainReport, DrainTracker};
pub use monitor::{BacklogMonitor, MonitorError, MonitorExit, MonitorReport};
pub use producer::{split_count, ProduceError, ProduceReport, Producer};
pub use submit::{JobSubmitter, SubmitError, SubmitReport, TaskOutput};
pub use work::{SleepWork, WorkContext, WorkError, WorkUnit};
pub use worker::{Worker, WorkerError, WorkerExit, WorkerReport};
