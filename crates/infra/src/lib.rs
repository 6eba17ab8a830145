//! Bulk job engine: job registry, background runner, durable queue and the
//! status/cancellation facade.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, EngineConfig, QueueSettings};
pub use jobs::{
    BackgroundRunner, ItemError, ItemProcessor, JobRegistry, JobStatus, JobView, JobsError,
    JobsFacade, processor_fn,
};
