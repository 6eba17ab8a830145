//! Queue broker abstraction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use bulkops_core::JobId;

use super::types::QueuedJob;

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown queue lane: {0}")]
    UnknownLane(String),
    #[error("invalid queue payload: {0}")]
    InvalidPayload(String),
    #[error("queued job not found: {0}")]
    NotFound(JobId),
    /// The attempt no longer holds the job: it was recovered and re-claimed,
    /// or already settled.
    #[error("lease on queued job {0} was lost")]
    LeaseLost(JobId),
    #[error("queue storage error: {0}")]
    Storage(String),
    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent store behind the durable queue gateway.
///
/// Implementations must make [`claim_next`](QueueBroker::claim_next) exclusive:
/// a waiting job is handed to at most one worker per attempt. A claim starts a
/// lease on the attempt (`updated_at`), renewed by
/// [`heartbeat`](QueueBroker::heartbeat) and progress reports. Writes made on
/// behalf of an attempt are identified by `attempt` (the job's
/// `attempts_made` at claim time) and fail with [`QueueError::LeaseLost`]
/// unless the job is still `active` in that attempt.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Persist a new `waiting` job.
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Load a job of `lane`.
    async fn get(&self, lane: &str, job_id: JobId) -> Result<QueuedJob, QueueError>;

    /// Claim the oldest waiting job of `lane` whose backoff has elapsed.
    ///
    /// The claimed job is `active` with `attempts_made` incremented and
    /// `progress` reset to 0.
    async fn claim_next(&self, lane: &str) -> Result<Option<QueuedJob>, QueueError>;

    /// Renew the lease of an active attempt.
    async fn heartbeat(&self, job_id: JobId, attempt: u32) -> Result<(), QueueError>;

    /// Record the completion percentage of an active attempt and renew its lease.
    async fn report_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        progress: u8,
    ) -> Result<(), QueueError>;

    /// Mark an active attempt `completed` with its result.
    async fn complete(&self, job_id: JobId, attempt: u32, result: Value) -> Result<(), QueueError>;

    /// Record a failed attempt.
    ///
    /// With `retry_at` the job goes back to `waiting` and becomes claimable at
    /// that instant; without it the job is terminally `failed`.
    async fn fail_attempt(
        &self,
        job_id: JobId,
        attempt: u32,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError>;

    /// Move `active` jobs of `lane` whose lease has not been renewed for
    /// longer than `stall_timeout` back to `waiting`.
    async fn recover_stalled(
        &self,
        lane: &str,
        stall_timeout: Duration,
    ) -> Result<u64, QueueError>;

    /// Number of `waiting` jobs of `lane`, including ones still in backoff.
    async fn pending(&self, lane: &str) -> Result<u64, QueueError>;
}
