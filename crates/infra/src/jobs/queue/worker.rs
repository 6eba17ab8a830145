use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use bulkops_core::JobId;

use super::broker::{QueueBroker, QueueError};
use super::lane::LaneConfig;
use super::types::{LaneJobResult, QueuedJob};
use crate::jobs::item_loop::{LoopOutcome, LoopSettings, ProgressSink, SinkError, Tally, run_items};
use crate::jobs::processor::ItemProcessor;
use crate::jobs::types::ProgressDelta;

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// A configured lane: its settings plus the processor its items go through.
pub(crate) struct Lane {
    pub(crate) config: LaneConfig,
    pub(crate) processor: Arc<dyn ItemProcessor<Value>>,
}

pub(crate) struct LaneWorker {
    pub(crate) broker: Arc<dyn QueueBroker>,
    pub(crate) lane: Arc<Lane>,
    pub(crate) poll_interval: Duration,
    pub(crate) stall_timeout: Duration,
    pub(crate) final_error_limit: usize,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) shutdown: CancellationToken,
}

/// Terminal write of one attempt.
enum Settlement {
    Complete(Value),
    Fail {
        reason: String,
        retry_at: Option<DateTime<Utc>>,
    },
}

impl LaneWorker {
    pub(crate) fn spawn(self, name: String) -> JoinHandle<()> {
        info!(worker.name = %name, "lane worker started");
        let span = info_span!("lane_worker", worker.name = %name);
        tokio::spawn(async move { self.run().await }.instrument(span))
    }

    /// Run queued jobs until shut down, or until the lane is drained if
    /// `shutdown_when_queue_empty` is set.
    ///
    /// While idle, the worker re-queues jobs whose lease expired at most once
    /// per `stall_timeout`.
    pub(crate) async fn run(&self) {
        let lane = self.lane.config.name.as_str();
        let mut last_recovery = Instant::now();
        loop {
            if self.shutdown.is_cancelled() {
                debug!("shutdown requested, stopping lane worker");
                break;
            }

            match self.run_next_job().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(error) => {
                    error!(%error, "failed to run queue job");
                    self.idle().await;
                    continue;
                }
            }

            if last_recovery.elapsed() >= self.stall_timeout {
                last_recovery = Instant::now();
                match self.broker.recover_stalled(lane, self.stall_timeout).await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        warn!(recovered, "re-queued jobs with expired leases");
                        continue;
                    }
                    Err(error) => error!(%error, "failed to recover stalled jobs"),
                }
            }

            if self.shutdown_when_queue_empty {
                match self.broker.pending(lane).await {
                    Ok(0) => {
                        debug!("lane drained, stopping lane worker");
                        break;
                    }
                    // jobs still in backoff
                    Ok(_) => {}
                    Err(error) => error!(%error, "failed to count pending jobs"),
                }
            } else {
                trace!(poll_interval = ?self.poll_interval, "no claimable queue job");
            }
            self.idle().await;
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = sleep(self.poll_interval) => {}
        }
    }

    /// Run the next claimable job of the lane, if there is one.
    async fn run_next_job(&self) -> Result<Option<JobId>, QueueError> {
        let Some(job) = self.broker.claim_next(&self.lane.config.name).await? else {
            return Ok(None);
        };

        let job_id = job.id;
        let span = info_span!("queue_job", job.id = %job_id, attempt = job.attempts_made);
        self.execute(job).instrument(span).await?;
        Ok(Some(job_id))
    }

    async fn execute(&self, job: QueuedJob) -> Result<(), QueueError> {
        debug!(owner = %job.owner, max_attempts = job.max_attempts, "running queue job");

        let items = match job.items() {
            Ok(items) => items.to_vec(),
            Err(error) => {
                // retrying cannot fix a malformed payload
                error!(%error, "queue job has no runnable items");
                let settlement = Settlement::Fail {
                    reason: error.to_string(),
                    retry_at: None,
                };
                return self.settle(&job, settlement).await;
            }
        };

        let config = &self.lane.config;
        let settings = LoopSettings {
            batch_size: config.batch_size,
            batch_pause: config.batch_pause,
            final_error_limit: self.final_error_limit,
        };
        let sink = BrokerSink {
            broker: self.broker.as_ref(),
            job_id: job.id,
            attempt: job.attempts_made,
            last_percent: AtomicU8::new(job.progress),
        };
        let lease = CancellationToken::new();

        let work = run_items(
            items,
            self.lane.processor.as_ref(),
            &sink,
            Some(&lease),
            &settings,
        );
        let outcome = self.hold_lease(&job, &lease, work).await;

        if lease.is_cancelled() {
            warn!(
                processed = outcome.tally().processed,
                "queue job lease lost, discarding attempt"
            );
            return Ok(());
        }

        let reason = match outcome {
            LoopOutcome::Completed(tally) => {
                info!(
                    processed = tally.processed,
                    succeeded = tally.succeeded,
                    failed = tally.failed,
                    "queue job completed"
                );
                let result = serde_json::to_value(LaneJobResult::from(tally))?;
                return self.settle(&job, Settlement::Complete(result)).await;
            }
            LoopOutcome::Cancelled(_) => "attempt cancelled".to_string(),
            LoopOutcome::Aborted { reason, .. } => reason,
        };

        let retry_at = if config.retry.should_retry(job.attempts_made) {
            let delay = config.retry.delay_for_attempt(job.attempts_made);
            warn!(%reason, retry_in = ?delay, "queue job attempt failed, scheduling retry");
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
        } else {
            error!(%reason, attempts = job.attempts_made, "queue job failed permanently");
            None
        };
        self.settle(&job, Settlement::Fail { reason, retry_at }).await
    }

    /// Drive `work` while renewing the attempt's lease.
    ///
    /// A lease lost to recovery trips `lease`, which stops the item loop at its
    /// next checkpoint.
    async fn hold_lease<F>(&self, job: &QueuedJob, lease: &CancellationToken, work: F) -> F::Output
    where
        F: Future,
    {
        let mut work = pin!(work);
        let mut heartbeat = interval((self.stall_timeout / 3).max(MIN_HEARTBEAT));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the claim itself started the lease
        heartbeat.tick().await;

        loop {
            tokio::select! {
                outcome = work.as_mut() => return outcome,
                _ = heartbeat.tick(), if !lease.is_cancelled() => {
                    match self.broker.heartbeat(job.id, job.attempts_made).await {
                        Ok(()) => {}
                        Err(QueueError::LeaseLost(_)) => lease.cancel(),
                        Err(error) => warn!(%error, "failed to renew queue job lease"),
                    }
                }
            }
        }
    }

    /// Write the attempt's outcome, retrying storage errors with the lane's
    /// backoff. A lost lease means another attempt owns the job now.
    async fn settle(&self, job: &QueuedJob, settlement: Settlement) -> Result<(), QueueError> {
        let retry = &self.lane.config.retry;
        let mut writes = 1;
        loop {
            let written = match &settlement {
                Settlement::Complete(result) => {
                    self.broker
                        .complete(job.id, job.attempts_made, result.clone())
                        .await
                }
                Settlement::Fail { reason, retry_at } => {
                    self.broker
                        .fail_attempt(job.id, job.attempts_made, reason, *retry_at)
                        .await
                }
            };

            match written {
                Ok(()) => return Ok(()),
                Err(QueueError::LeaseLost(_)) => {
                    warn!("queue job lease lost, outcome not recorded");
                    return Ok(());
                }
                Err(error) if retry.should_retry(writes) => {
                    let delay = retry.delay_for_attempt(writes);
                    warn!(%error, retry_in = ?delay, "failed to record queue job outcome, retrying");
                    sleep(delay).await;
                    writes += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Forwards the completion percentage to the broker whenever it changes.
struct BrokerSink<'a> {
    broker: &'a dyn QueueBroker,
    job_id: JobId,
    attempt: u32,
    last_percent: AtomicU8,
}

#[async_trait]
impl ProgressSink for BrokerSink<'_> {
    async fn record(&self, tally: &Tally, _delta: ProgressDelta) -> Result<(), SinkError> {
        let percent = tally.percent();
        if self.last_percent.swap(percent, Ordering::Relaxed) == percent {
            return Ok(());
        }
        self.broker
            .report_progress(self.job_id, self.attempt, percent)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}
