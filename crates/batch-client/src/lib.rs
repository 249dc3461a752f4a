//! # Batch Client
//!
//! Minimal client for the Azure Batch REST API covering what a job
//! submission flow needs: creating a job (optionally with an auto-pool),
//! adding tasks in bulk, polling for task completion, reading task output
//! and deleting the job.
//!
//! The [`BatchService`] trait is the seam used by callers so they can be
//! tested without a live service; [`BatchClient`] is the HTTP implementation
//! authenticated with the account's Shared Key.

pub mod auth;
pub mod client;
pub mod error;
pub mod models;

pub use auth::BatchCredentials;
pub use client::{BatchClient, BatchClientConfig, BatchService, MAX_TASKS_PER_REQUEST};
pub use error::{BatchError, TaskAddFailure};
pub use models::{
    ApplicationPackageReference, AutoPoolSpecification, EnvironmentSetting, ImageReference,
    JobSpec, NodeFillType, PoolInformation, PoolLifetimeOption, PoolSpecification,
    TaskExecutionInfo, TaskInfo, TaskSchedulingPolicy, TaskSpec, TaskState,
    VirtualMachineConfiguration,
};
