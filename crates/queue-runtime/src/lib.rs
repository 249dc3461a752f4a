//! # Queue Runtime
//!
//! Provider-agnostic runtime for durable, at-least-once message queues with
//! visibility-timeout leases.
//!
//! This library provides:
//! - A consumer-facing [`QueueClient`] trait covering create-if-absent, send,
//!   approximate counting, leasing, acknowledging and lease extension
//! - An in-memory provider with full visibility-timeout semantics
//! - An Azure Storage Queue provider speaking the REST protocol
//! - A transport retry policy with exponential backoff
//!
//! ## Module Organization
//!
//! - [error] - Error types for all queue operations
//! - [message] - Message structures, identifiers and receipt handles
//! - [provider] - Provider types and configuration
//! - [client] - Client traits and implementations
//! - [retry] - Retry policy for transient transport failures
//! - [providers] - Concrete queue backends

// Module declarations
pub mod client;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;
pub mod retry;

// Re-export commonly used types at crate root for convenience
pub use client::{QueueClient, QueueClientFactory, QueueProvider, StandardQueueClient};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
pub use provider::{
    AzureStorageConfig, InMemoryConfig, ProviderConfig, ProviderType, QueueConfig,
    StorageConnectionString,
};
pub use providers::{AzureStorageQueueProvider, InMemoryProvider};
pub use retry::RetryPolicy;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
