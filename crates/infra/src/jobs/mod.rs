//! Bulk job execution engine.
//!
//! ## Design
//!
//! - A caller submits a list of opaque work items plus an [`ItemProcessor`]
//! - Each item either succeeds or fails on its own; failures are recorded,
//!   never thrown
//! - Two execution paths: in-process background tasks ([`BackgroundRunner`])
//!   and a persisted queue of named lanes ([`queue::DurableQueueGateway`])
//! - Progress is polled, cancellation is cooperative
//!
//! ## Components
//!
//! - `JobRecord`: identity, counters and status of one bulk job
//! - `JobRegistry`: process-local store of records with bounded retention
//! - `BackgroundRunner`: drives items on a detached tokio task
//! - `DurableQueueGateway`: lane workers with whole-job retry
//! - `JobsFacade`: get/list/cancel surface for request handlers

pub mod facade;
pub mod item_loop;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod types;

pub use facade::{JobsError, JobsFacade};
pub use processor::{ItemError, ItemProcessor, Labelled, processor_fn};
pub use registry::{InMemoryJobRegistry, JobRegistry, JobTicket, RegistryError, RetentionPolicy};
pub use runner::{BackgroundRunner, RunnerConfig, SubmitError};
pub use types::{
    BackoffStrategy, Completion, ItemFailure, JobProgress, JobRecord, JobStatus, JobView,
    ProgressDelta, RetryPolicy,
};
