//! Persisted queue job types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use bulkops_core::{JobId, OwnerId};

use super::broker::QueueError;
use crate::jobs::item_loop::Tally;
use crate::jobs::types::ItemFailure;

/// State of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Waiting => "waiting",
            QueueState::Active => "active",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueState::Completed | QueueState::Failed)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(QueueState::Waiting),
            "active" => Ok(QueueState::Active),
            "completed" => Ok(QueueState::Completed),
            "failed" => Ok(QueueState::Failed),
            other => Err(QueueError::Storage(format!("unknown queue state: {other}"))),
        }
    }
}

/// A job handed to the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub lane: String,
    pub owner: OwnerId,
    /// Opaque JSON; must carry an `items` array.
    pub payload: Value,
    pub state: QueueState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// 0..=100
    pub progress: u8,
    pub result: Option<Value>,
    pub failed_reason: Option<String>,
    /// Not claimable before this instant (retry backoff).
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    /// A fresh `waiting` job, claimable immediately.
    ///
    /// Fails with [`QueueError::InvalidPayload`] if `payload.items` is not an
    /// array.
    pub fn new(
        lane: impl Into<String>,
        owner: OwnerId,
        payload: Value,
        max_attempts: u32,
    ) -> Result<Self, QueueError> {
        validate_payload(&payload)?;
        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            lane: lane.into(),
            owner,
            payload,
            state: QueueState::Waiting,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            progress: 0,
            result: None,
            failed_reason: None,
            available_at: now,
            created_at: now,
            updated_at: now,
            finished_at: None,
        })
    }

    /// The work items of the payload.
    pub fn items(&self) -> Result<&[Value], QueueError> {
        validate_payload(&self.payload)
    }

    pub fn status(&self) -> QueueJobStatus {
        QueueJobStatus {
            job_id: self.id,
            lane: self.lane.clone(),
            state: self.state,
            progress: self.progress,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            result: self.result.clone(),
            failed_reason: self.failed_reason.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

fn validate_payload(payload: &Value) -> Result<&[Value], QueueError> {
    payload
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| QueueError::InvalidPayload("payload must contain an `items` array".into()))
}

/// Acknowledgement returned by an enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub status: &'static str,
}

impl EnqueueReceipt {
    pub fn queued(job_id: JobId) -> Self {
        Self {
            job_id,
            status: "queued",
        }
    }
}

/// Status snapshot of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueJobStatus {
    pub job_id: JobId,
    pub lane: String,
    pub state: QueueState,
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub result: Option<Value>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result stored on a completed queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneJobResult {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<ItemFailure>,
}

impl From<Tally> for LaneJobResult {
    fn from(tally: Tally) -> Self {
        Self {
            total: tally.total,
            processed: tally.processed,
            succeeded: tally.succeeded,
            failed: tally.failed,
            errors: tally.into_first_errors(),
        }
    }
}
