//! Process-local job registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bulkops_core::{JobId, OwnerId};

use super::types::{Completion, JobRecord, JobStatus, ProgressDelta};

/// Default number of records kept in memory.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default bound of the trailing per-job error log.
pub const DEFAULT_ERROR_LOG_LIMIT: usize = 50;

/// Handle returned by [`JobRegistry::create`].
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: JobId,
    /// Tripped by [`JobRegistry::request_cancel`]; checked once per item.
    pub cancellation: CancellationToken,
}

/// Job registry abstraction.
///
/// Implementations synchronize every mutation internally; callers never lock.
pub trait JobRegistry: Send + Sync {
    /// Allocate a `PROCESSING` record with zeroed counters.
    fn create(&self, owner: OwnerId, kind: &str, total: u64) -> Result<JobTicket, RegistryError>;

    /// Get a snapshot of a record.
    fn get(&self, job_id: JobId) -> Result<JobRecord, RegistryError>;

    /// Merge an incremental update.
    ///
    /// Unknown (e.g. evicted) or terminal jobs are a silent no-op.
    fn update_progress(&self, job_id: JobId, delta: ProgressDelta) -> Result<(), RegistryError>;

    /// Mark a job `COMPLETED`. No-op for unknown or terminal jobs.
    fn complete(&self, job_id: JobId, completion: Completion) -> Result<(), RegistryError>;

    /// Mark a job `FAILED`. No-op for unknown or terminal jobs.
    fn fail(&self, job_id: JobId, reason: &str) -> Result<(), RegistryError>;

    /// Mark a job `CANCELLED`. No-op for unknown or terminal jobs.
    fn mark_cancelled(&self, job_id: JobId, completion: Completion) -> Result<(), RegistryError>;

    /// Trip the job's cancellation token.
    ///
    /// Returns `true` if the job is still `PROCESSING`, `false` if terminal.
    fn request_cancel(&self, job_id: JobId) -> Result<bool, RegistryError>;

    /// Jobs of one owner, most recently started first.
    fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<JobRecord>, RegistryError>;

    /// Jobs whose kind starts with `prefix`, most recently started first.
    ///
    /// `owner = None` lists every owner's jobs; authorizing that view is the
    /// caller's responsibility.
    fn list_by_kind_prefix(
        &self,
        owner: Option<OwnerId>,
        prefix: &str,
    ) -> Result<Vec<JobRecord>, RegistryError>;

    /// Number of records currently retained.
    fn len(&self) -> Result<usize, RegistryError>;
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job registry unavailable: {0}")]
    Unavailable(String),
}

/// Retention policy of the in-memory registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of records; inserting past it evicts the oldest-started
    /// record regardless of status.
    pub capacity: usize,
    /// Terminal records completed longer ago than this are pruned on insert.
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_age: None,
        }
    }
}

impl RetentionPolicy {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

#[derive(Debug)]
struct Entry {
    record: JobRecord,
    cancellation: CancellationToken,
}

/// In-memory job registry with bounded retention.
#[derive(Debug)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<JobId, Entry>>,
    retention: RetentionPolicy,
    error_log_limit: usize,
}

impl InMemoryJobRegistry {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
            error_log_limit: DEFAULT_ERROR_LOG_LIMIT,
        }
    }

    pub fn with_error_log_limit(mut self, limit: usize) -> Self {
        self.error_log_limit = limit;
        self
    }

    pub fn arc(retention: RetentionPolicy) -> Arc<Self> {
        Arc::new(Self::new(retention))
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Entry>>, RegistryError> {
        self.jobs
            .read()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Entry>>, RegistryError> {
        self.jobs
            .write()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))
    }

    fn prune_expired(&self, jobs: &mut HashMap<JobId, Entry>) {
        let Some(max_age) = self.retention.max_age else {
            return;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return;
        };
        let cutoff = Utc::now() - max_age;

        jobs.retain(|id, entry| {
            let keep = entry.record.completed_at.is_none_or(|at| at >= cutoff);
            if !keep {
                debug!(job_id = %id, "pruning expired job record");
            }
            keep
        });
    }

    fn evict_oldest(jobs: &mut HashMap<JobId, Entry>) {
        let oldest = jobs
            .values()
            .min_by_key(|e| (e.record.started_at, e.record.id))
            .map(|e| e.record.id);

        if let Some(id) = oldest {
            debug!(job_id = %id, "evicting oldest job record");
            jobs.remove(&id);
        }
    }

    fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        completion: Completion,
    ) -> Result<(), RegistryError> {
        let mut jobs = self.write()?;
        if let Some(entry) = jobs.get_mut(&job_id) {
            entry.record.finish(status, completion);
        }
        Ok(())
    }

    fn sorted(mut records: Vec<JobRecord>) -> Vec<JobRecord> {
        records.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        records
    }
}

impl Default for InMemoryJobRegistry {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn create(&self, owner: OwnerId, kind: &str, total: u64) -> Result<JobTicket, RegistryError> {
        let record = JobRecord::new(owner, kind, total);
        let id = record.id;
        let cancellation = CancellationToken::new();

        let mut jobs = self.write()?;
        self.prune_expired(&mut jobs);
        while !jobs.is_empty() && jobs.len() >= self.retention.capacity {
            Self::evict_oldest(&mut jobs);
        }
        jobs.insert(
            id,
            Entry {
                record,
                cancellation: cancellation.clone(),
            },
        );

        Ok(JobTicket { id, cancellation })
    }

    fn get(&self, job_id: JobId) -> Result<JobRecord, RegistryError> {
        self.read()?
            .get(&job_id)
            .map(|e| e.record.clone())
            .ok_or(RegistryError::NotFound(job_id))
    }

    fn update_progress(&self, job_id: JobId, delta: ProgressDelta) -> Result<(), RegistryError> {
        let mut jobs = self.write()?;
        if let Some(entry) = jobs.get_mut(&job_id) {
            entry.record.apply_delta(delta, self.error_log_limit);
        }
        Ok(())
    }

    fn complete(&self, job_id: JobId, completion: Completion) -> Result<(), RegistryError> {
        self.finish(job_id, JobStatus::Completed, completion)
    }

    fn fail(&self, job_id: JobId, reason: &str) -> Result<(), RegistryError> {
        let mut jobs = self.write()?;
        if let Some(entry) = jobs.get_mut(&job_id) {
            entry.record.fail(reason);
        }
        Ok(())
    }

    fn mark_cancelled(&self, job_id: JobId, completion: Completion) -> Result<(), RegistryError> {
        self.finish(job_id, JobStatus::Cancelled, completion)
    }

    fn request_cancel(&self, job_id: JobId) -> Result<bool, RegistryError> {
        let jobs = self.read()?;
        let entry = jobs.get(&job_id).ok_or(RegistryError::NotFound(job_id))?;
        if entry.record.status.is_terminal() {
            return Ok(false);
        }
        entry.cancellation.cancel();
        Ok(true)
    }

    fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<JobRecord>, RegistryError> {
        let jobs = self.read()?;
        let records = jobs
            .values()
            .filter(|e| e.record.owner == owner)
            .map(|e| e.record.clone())
            .collect();
        Ok(Self::sorted(records))
    }

    fn list_by_kind_prefix(
        &self,
        owner: Option<OwnerId>,
        prefix: &str,
    ) -> Result<Vec<JobRecord>, RegistryError> {
        let jobs = self.read()?;
        let records = jobs
            .values()
            .filter(|e| {
                owner.is_none_or(|o| e.record.owner == o) && e.record.kind.starts_with(prefix)
            })
            .map(|e| e.record.clone())
            .collect();
        Ok(Self::sorted(records))
    }

    fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.read()?.len())
    }
}
