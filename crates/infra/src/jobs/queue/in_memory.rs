//! In-memory queue broker for development and tests.

use std::collections::HashMap;
use std::time::Duration;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use bulkops_core::JobId;

use super::broker::{QueueBroker, QueueError};
use super::types::{QueueState, QueuedJob};

/// Process-local broker. Jobs do not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryQueueBroker {
    jobs: Mutex<HashMap<JobId, QueuedJob>>,
}

impl InMemoryQueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, QueuedJob>>, QueueError> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::Storage("queue lock poisoned".into()))
    }

    /// Apply `f` to the job if `attempt` still holds its lease, renewing it.
    fn with_lease<T>(
        &self,
        job_id: JobId,
        attempt: u32,
        f: impl FnOnce(&mut QueuedJob) -> T,
    ) -> Result<T, QueueError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if job.state != QueueState::Active || job.attempts_made != attempt {
            return Err(QueueError::LeaseLost(job_id));
        }
        let out = f(job);
        job.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl QueueBroker for InMemoryQueueBroker {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.lock()?.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, lane: &str, job_id: JobId) -> Result<QueuedJob, QueueError> {
        self.lock()?
            .get(&job_id)
            .filter(|j| j.lane == lane)
            .cloned()
            .ok_or(QueueError::NotFound(job_id))
    }

    async fn claim_next(&self, lane: &str) -> Result<Option<QueuedJob>, QueueError> {
        let now = Utc::now();
        let mut jobs = self.lock()?;
        let next = jobs
            .values_mut()
            .filter(|j| j.lane == lane && j.state == QueueState::Waiting && j.available_at <= now)
            .min_by_key(|j| (j.created_at, j.id));

        Ok(next.map(|job| {
            job.state = QueueState::Active;
            job.attempts_made += 1;
            job.progress = 0;
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn heartbeat(&self, job_id: JobId, attempt: u32) -> Result<(), QueueError> {
        self.with_lease(job_id, attempt, |_| ())
    }

    async fn report_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        progress: u8,
    ) -> Result<(), QueueError> {
        self.with_lease(job_id, attempt, |job| job.progress = progress.min(100))
    }

    async fn complete(&self, job_id: JobId, attempt: u32, result: Value) -> Result<(), QueueError> {
        self.with_lease(job_id, attempt, |job| {
            job.state = QueueState::Completed;
            job.progress = 100;
            job.result = Some(result);
            job.failed_reason = None;
            job.finished_at = Some(Utc::now());
        })
    }

    async fn fail_attempt(
        &self,
        job_id: JobId,
        attempt: u32,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        self.with_lease(job_id, attempt, |job| {
            job.failed_reason = Some(reason.to_string());
            match retry_at {
                Some(at) => {
                    job.state = QueueState::Waiting;
                    job.available_at = at;
                }
                None => {
                    job.state = QueueState::Failed;
                    job.finished_at = Some(Utc::now());
                }
            }
        })
    }

    async fn recover_stalled(
        &self,
        lane: &str,
        stall_timeout: Duration,
    ) -> Result<u64, QueueError> {
        let stalled_before = chrono::Duration::from_std(stall_timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut jobs = self.lock()?;
        let mut recovered = 0;
        for job in jobs.values_mut().filter(|j| {
            j.lane == lane && j.state == QueueState::Active && j.updated_at < stalled_before
        }) {
            job.state = QueueState::Waiting;
            job.updated_at = Utc::now();
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn pending(&self, lane: &str) -> Result<u64, QueueError> {
        Ok(self
            .lock()?
            .values()
            .filter(|j| j.lane == lane && j.state == QueueState::Waiting)
            .count() as u64)
    }
}
