//! Status and cancellation surface for request handlers.
//!
//! Handlers authorize against [`JobView::owner`] and translate
//! [`JobsError::NotFound`] and `cancel_job == false` into their own response
//! codes. Which execution path a bulk operation takes is the handler's call.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use bulkops_core::{JobId, OwnerId};

use super::processor::ItemProcessor;
use super::queue::{DurableQueueGateway, EnqueueReceipt, QueueError, QueueJobStatus};
use super::registry::{JobRegistry, RegistryError};
use super::runner::{BackgroundRunner, SubmitError};
use super::types::JobView;

/// Errors surfaced by [`JobsFacade`].
#[derive(Debug, thiserror::Error)]
pub enum JobsError {
    /// Unknown, evicted or (for cancellation) durable job.
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Registry(RegistryError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Queue(QueueError),
    #[error("no durable queue gateway configured")]
    NoGateway,
}

impl From<RegistryError> for JobsError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => JobsError::NotFound(id),
            other => JobsError::Registry(other),
        }
    }
}

impl From<QueueError> for JobsError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => JobsError::NotFound(id),
            other => JobsError::Queue(other),
        }
    }
}

/// Entry point for submitting, polling and cancelling bulk jobs.
#[derive(Clone)]
pub struct JobsFacade {
    runner: BackgroundRunner,
    gateway: Option<Arc<DurableQueueGateway>>,
}

impl JobsFacade {
    pub fn new(runner: BackgroundRunner) -> Self {
        Self {
            runner,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<DurableQueueGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        self.runner.registry()
    }

    pub fn gateway(&self) -> Option<&Arc<DurableQueueGateway>> {
        self.gateway.as_ref()
    }

    /// Run a bulk job in-process. Returns before any item is attempted.
    pub fn submit_background<I, P>(
        &self,
        owner: OwnerId,
        kind: &str,
        items: Vec<I>,
        processor: P,
        batch_size: usize,
    ) -> Result<JobId, JobsError>
    where
        I: Send + 'static,
        P: ItemProcessor<I> + 'static,
    {
        Ok(self.runner.submit(owner, kind, items, processor, batch_size)?)
    }

    /// Hand a bulk job to the durable queue.
    pub async fn enqueue_durable(
        &self,
        lane: &str,
        owner: OwnerId,
        payload: Value,
    ) -> Result<EnqueueReceipt, JobsError> {
        let gateway = self.gateway.as_ref().ok_or(JobsError::NoGateway)?;
        Ok(gateway.enqueue(lane, owner, payload).await?)
    }

    pub fn get_job(&self, job_id: JobId) -> Result<JobView, JobsError> {
        Ok(self.registry().get(job_id)?.into())
    }

    /// Jobs whose kind starts with `kind_prefix`, newest first.
    ///
    /// `owner = None` lists every owner's jobs.
    pub fn list_jobs(
        &self,
        owner: Option<OwnerId>,
        kind_prefix: &str,
    ) -> Result<Vec<JobView>, JobsError> {
        let records = match owner {
            Some(owner) if kind_prefix.is_empty() => self.registry().list_by_owner(owner)?,
            _ => self.registry().list_by_kind_prefix(owner, kind_prefix)?,
        };
        Ok(records.into_iter().map(JobView::from).collect())
    }

    /// Request cooperative cancellation of a background job.
    ///
    /// `true` if the job was running and will stop at its next checkpoint,
    /// `false` if it already finished.
    pub fn cancel_job(&self, job_id: JobId, requested_by: OwnerId) -> Result<bool, JobsError> {
        let accepted = self.registry().request_cancel(job_id)?;
        info!(job_id = %job_id, requested_by = %requested_by, accepted, "bulk job cancellation requested");
        Ok(accepted)
    }

    /// Status of a durable job.
    pub async fn durable_status(
        &self,
        lane: &str,
        job_id: JobId,
    ) -> Result<QueueJobStatus, JobsError> {
        let gateway = self.gateway.as_ref().ok_or(JobsError::NoGateway)?;
        Ok(gateway.get_status(lane, job_id).await?)
    }

    /// Poll a background job every `poll` until it is terminal.
    pub async fn wait_for_completion(
        &self,
        job_id: JobId,
        poll: Duration,
    ) -> Result<JobView, JobsError> {
        loop {
            let view = self.get_job(job_id)?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
