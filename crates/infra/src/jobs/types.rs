//! Core job types and policies.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bulkops_core::{JobId, OwnerId};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Items are still being attempted.
    Processing,
    /// Every item was attempted (some may have failed).
    Completed,
    /// The job was aborted at the orchestration level.
    Failed,
    /// A cancellation request was observed at a checkpoint.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_label: String,
    pub message: String,
}

impl ItemFailure {
    pub fn new(item_label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            item_label: item_label.into(),
            message: message.into(),
        }
    }
}

/// Progress counters of a job.
///
/// `extensions` is the only place for kind-specific fields (e.g. the number
/// of images downloaded by an image job).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<ItemFailure>,
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl JobProgress {
    pub fn with_total(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// `round(processed / total * 100)`, or 0 when there is nothing to do.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let ratio = self.processed.min(self.total) as f64 / self.total as f64;
        (ratio * 100.0).round() as u8
    }
}

/// Incremental progress update pushed by an execution path.
///
/// Counters are additive; `errors` are appended to the trailing error log;
/// `summary` replaces the previous one when set; `extensions` are merged key
/// by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressDelta {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<ItemFailure>,
    pub summary: Option<String>,
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl ProgressDelta {
    /// Delta for one item that succeeded.
    pub fn success() -> Self {
        Self {
            processed: 1,
            succeeded: 1,
            ..Default::default()
        }
    }

    /// Delta for one item that failed.
    pub fn failure(failure: ItemFailure) -> Self {
        Self {
            processed: 1,
            failed: 1,
            errors: vec![failure],
            ..Default::default()
        }
    }
}

/// Final fields written by a terminal transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Replaces the trailing error log with this (capped) list when set.
    pub errors: Option<Vec<ItemFailure>>,
    pub summary: Option<String>,
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Identity plus mutable progress/status for one bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner: OwnerId,
    pub kind: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new record in `PROCESSING`.
    pub fn new(owner: OwnerId, kind: impl Into<String>, total: u64) -> Self {
        Self {
            id: JobId::new(),
            owner,
            kind: kind.into(),
            status: JobStatus::Processing,
            progress: JobProgress::with_total(total),
            failure_reason: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Progress percentage; a completed job with nothing to do reports 100.
    pub fn progress_percent(&self) -> u8 {
        if self.progress.total == 0 && self.status == JobStatus::Completed {
            return 100;
        }
        self.progress.percent()
    }

    /// Seconds between start and completion (or now, while running).
    pub fn duration_seconds(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        let micros = (end - self.started_at).num_microseconds().unwrap_or(i64::MAX);
        micros.max(0) as f64 / 1_000_000.0
    }

    /// Merge an incremental update, keeping the counter invariants.
    ///
    /// Terminal records are frozen. `error_log_limit` bounds the trailing
    /// error log (most recent entries win).
    pub fn apply_delta(&mut self, delta: ProgressDelta, error_log_limit: usize) {
        if self.status.is_terminal() {
            return;
        }

        let p = &mut self.progress;
        p.processed = p.processed.saturating_add(delta.processed).min(p.total);
        p.succeeded = p.succeeded.saturating_add(delta.succeeded).min(p.processed);
        p.failed = p
            .failed
            .saturating_add(delta.failed)
            .min(p.processed - p.succeeded);

        p.errors.extend(delta.errors);
        if p.errors.len() > error_log_limit {
            let excess = p.errors.len() - error_log_limit;
            p.errors.drain(..excess);
        }

        if delta.summary.is_some() {
            p.summary = delta.summary;
        }
        p.extensions.extend(delta.extensions);
    }

    /// Move to `status` (must be terminal) and stamp `completed_at`.
    ///
    /// Returns false if the record already reached a terminal state.
    pub fn finish(&mut self, status: JobStatus, completion: Completion) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }

        self.status = status;
        self.completed_at = Some(Utc::now());
        if let Some(errors) = completion.errors {
            self.progress.errors = errors;
        }
        if completion.summary.is_some() {
            self.progress.summary = completion.summary;
        }
        self.progress.extensions.extend(completion.extensions);
        true
    }

    /// Transition to `FAILED` with a single top-level reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let finished = self.finish(
            JobStatus::Failed,
            Completion {
                summary: Some(format!("job failed: {reason}")),
                ..Default::default()
            },
        );
        if finished {
            self.failure_reason = Some(reason);
        }
        finished
    }
}

/// Read-only projection of a job handed to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    #[serde(skip)]
    owner: OwnerId,
    pub kind: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<ItemFailure>,
    pub summary: Option<String>,
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
}

impl JobView {
    /// Owner of the job, for caller-side authorization.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            owner: record.owner,
            kind: record.kind.clone(),
            status: record.status,
            progress_percent: record.progress_percent(),
            total: record.progress.total,
            processed: record.progress.processed,
            succeeded: record.progress.succeeded,
            failed: record.progress.failed,
            errors: record.progress.errors.clone(),
            summary: record.progress.summary.clone(),
            failure_reason: record.failure_reason.clone(),
            extensions: record.progress.extensions.clone(),
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_seconds: record.duration_seconds(),
        }
    }
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self::from(&record)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy of a queue lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate the delay before the attempt following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
