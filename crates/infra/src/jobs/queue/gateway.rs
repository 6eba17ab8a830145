//! Hands bulk jobs to the persisted queue and runs the lane workers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bulkops_core::{JobId, OwnerId};

use super::broker::{QueueBroker, QueueError};
use super::lane::LaneConfig;
use super::types::{EnqueueReceipt, QueueJobStatus, QueuedJob};
use super::worker::{Lane, LaneWorker};
use crate::jobs::processor::ItemProcessor;
use crate::jobs::runner::DEFAULT_FINAL_ERROR_LIMIT;

/// Default idle poll interval of lane workers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default age after which an unrenewed lease counts as stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable queue gateway: named lanes with worker pools and whole-job retry.
///
/// A job that fails an attempt re-runs its entire item list, so lane
/// processors must be idempotent.
pub struct DurableQueueGateway {
    broker: Arc<dyn QueueBroker>,
    lanes: BTreeMap<String, Arc<Lane>>,
    poll_interval: Duration,
    stall_timeout: Duration,
    final_error_limit: usize,
    shutdown_when_queue_empty: bool,
}

impl std::fmt::Debug for DurableQueueGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueueGateway")
            .field("lanes", &self.lanes.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .field("stall_timeout", &self.stall_timeout)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl DurableQueueGateway {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            broker,
            lanes: BTreeMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            final_error_limit: DEFAULT_FINAL_ERROR_LIMIT,
            shutdown_when_queue_empty: false,
        }
    }

    /// Configure a lane and the processor its items go through.
    ///
    /// Registering a lane name twice replaces the earlier configuration.
    pub fn register_lane<P>(mut self, config: LaneConfig, processor: P) -> Self
    where
        P: ItemProcessor<Value> + 'static,
    {
        let lane = Lane {
            config,
            processor: Arc::new(processor),
        };
        self.lanes.insert(lane.config.name.clone(), Arc::new(lane));
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set how long an active job may go without a lease renewal before it
    /// is treated as abandoned. Workers renew every third of this.
    pub fn stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn final_error_limit(mut self, limit: usize) -> Self {
        self.final_error_limit = limit;
        self
    }

    /// Make workers exit once their lane has no waiting jobs left.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    pub fn lane(&self, name: &str) -> Option<&LaneConfig> {
        self.lanes.get(name).map(|l| &l.config)
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    /// Persist a job on `lane` and return right away.
    pub async fn enqueue(
        &self,
        lane: &str,
        owner: OwnerId,
        payload: Value,
    ) -> Result<EnqueueReceipt, QueueError> {
        let config = self
            .lane(lane)
            .ok_or_else(|| QueueError::UnknownLane(lane.to_string()))?;
        let job = QueuedJob::new(lane, owner, payload, config.retry.max_attempts)?;
        let job_id = job.id;
        let items = job.items()?.len();

        self.broker.enqueue(job).await?;
        info!(job_id = %job_id, lane, owner = %owner, items, "bulk job queued");

        Ok(EnqueueReceipt::queued(job_id))
    }

    /// Status of a job on `lane`.
    pub async fn get_status(&self, lane: &str, job_id: JobId) -> Result<QueueJobStatus, QueueError> {
        if !self.lanes.contains_key(lane) {
            return Err(QueueError::UnknownLane(lane.to_string()));
        }
        Ok(self.broker.get(lane, job_id).await?.status())
    }

    /// Put jobs whose lease expired (their worker's process died) back into
    /// `waiting`. Attempts still renewing their lease are left alone.
    pub async fn recover_stalled(&self) -> Result<u64, QueueError> {
        let mut recovered = 0;
        for lane in self.lanes.keys() {
            let n = self.broker.recover_stalled(lane, self.stall_timeout).await?;
            if n > 0 {
                warn!(lane = %lane, recovered = n, "re-queued stalled jobs");
            }
            recovered += n;
        }
        Ok(recovered)
    }

    /// Recover stalled jobs, then start `concurrency` workers per lane.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<GatewayHandle, QueueError> {
        self.recover_stalled().await?;

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();
        for (name, lane) in &self.lanes {
            for i in 1..=lane.config.concurrency {
                let worker = LaneWorker {
                    broker: self.broker.clone(),
                    lane: lane.clone(),
                    poll_interval: self.poll_interval,
                    stall_timeout: self.stall_timeout,
                    final_error_limit: self.final_error_limit,
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    shutdown: shutdown.clone(),
                };
                handles.push(worker.spawn(format!("lane-worker-{name}-{i}")));
            }
        }

        Ok(GatewayHandle { handles, shutdown })
    }
}

/// Handle to the running lane workers.
#[derive(Debug)]
pub struct GatewayHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl GatewayHandle {
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop workers between jobs and wait for them. Running jobs finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wait_for_shutdown().await;
    }

    /// Wait for all workers to exit on their own.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "lane worker task panicked");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::jobs::processor::{ItemError, processor_fn};
    use crate::jobs::queue::in_memory::InMemoryQueueBroker;
    use crate::jobs::queue::types::{LaneJobResult, QueueState};
    use crate::jobs::types::RetryPolicy;

    fn broker() -> Arc<dyn QueueBroker> {
        Arc::new(InMemoryQueueBroker::new())
    }

    fn fast_lane(name: &str, attempts: u32) -> LaneConfig {
        LaneConfig::new(name)
            .batch_size(2)
            .batch_pause(Duration::ZERO)
            .retry(RetryPolicy::fixed(attempts, Duration::from_millis(5)))
    }

    async fn wait_for_state(gateway: &DurableQueueGateway, lane: &str, job_id: JobId, state: QueueState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while gateway.get_status(lane, job_id).await.unwrap().state != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue job did not reach the expected state");
    }

    async fn run_until_drained(gateway: &DurableQueueGateway) {
        let handle = gateway.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle.wait_for_shutdown())
            .await
            .expect("workers did not drain the queue");
    }

    #[tokio::test]
    async fn unknown_lane_is_rejected() {
        let gateway = DurableQueueGateway::new(broker());

        let err = gateway
            .enqueue("bulk-teleport", OwnerId::new(), json!({ "items": [] }))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::UnknownLane(lane) if lane == "bulk-teleport"));
    }

    #[tokio::test]
    async fn payload_must_carry_items() {
        let gateway = DurableQueueGateway::new(broker())
            .register_lane(fast_lane("bulk-price", 1), processor_fn(|_: Value| async { Ok(()) }));

        let err = gateway
            .enqueue("bulk-price", OwnerId::new(), json!({ "skus": ["a"] }))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::InvalidPayload(_)));
        assert_eq!(gateway.broker().pending("bulk-price").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn completed_job_reports_result() {
        let gateway = DurableQueueGateway::new(broker())
            .register_lane(
                fast_lane("bulk-price", 1),
                processor_fn(|item: Value| async move {
                    match item["price"].as_f64() {
                        Some(p) if p > 0.0 => Ok(()),
                        _ => Err(ItemError::item("price must be positive")),
                    }
                }),
            )
            .poll_interval(Duration::from_millis(5))
            .shutdown_when_queue_empty();

        let receipt = gateway
            .enqueue(
                "bulk-price",
                OwnerId::new(),
                json!({ "items": [{ "price": 10.0 }, { "price": -1.0 }, { "price": 3.5 }] }),
            )
            .await
            .unwrap();
        assert_eq!(receipt.status, "queued");

        run_until_drained(&gateway).await;

        let status = gateway.get_status("bulk-price", receipt.job_id).await.unwrap();
        assert_eq!(status.state, QueueState::Completed);
        assert_eq!(status.progress, 100);
        assert_eq!(status.attempts_made, 1);
        let result: LaneJobResult = serde_json::from_value(status.result.unwrap()).unwrap();
        assert_eq!((result.total, result.succeeded, result.failed), (3, 2, 1));
        assert_eq!(result.errors[0].item_label, "item[1]");
    }

    #[tokio::test]
    async fn failed_attempt_is_retried_without_duplicating_effects() {
        let catalog = Arc::new(Mutex::new(HashSet::new()));
        let writes = Arc::new(AtomicU32::new(0));
        let failed_once = Arc::new(AtomicBool::new(false));

        let processor = {
            let catalog = catalog.clone();
            let writes = writes.clone();
            let failed_once = failed_once.clone();
            processor_fn(move |item: Value| {
                let catalog = catalog.clone();
                let writes = writes.clone();
                let failed_once = failed_once.clone();
                async move {
                    let sku = item["sku"].as_str().unwrap_or_default().to_string();
                    if sku == "C" && !failed_once.swap(true, Ordering::SeqCst) {
                        return Err(ItemError::abort("catalog store timed out"));
                    }
                    // upsert keyed by sku
                    if catalog.lock().unwrap().insert(sku) {
                        writes.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            })
        };

        let gateway = DurableQueueGateway::new(broker())
            .register_lane(fast_lane("bulk-create", 3), processor)
            .poll_interval(Duration::from_millis(5))
            .shutdown_when_queue_empty();
        let receipt = gateway
            .enqueue(
                "bulk-create",
                OwnerId::new(),
                json!({ "items": [{ "sku": "A" }, { "sku": "B" }, { "sku": "C" }, { "sku": "D" }] }),
            )
            .await
            .unwrap();

        run_until_drained(&gateway).await;

        let status = gateway.get_status("bulk-create", receipt.job_id).await.unwrap();
        assert_eq!(status.state, QueueState::Completed);
        assert_eq!(status.attempts_made, 2);
        assert_eq!(writes.load(Ordering::SeqCst), 4);
        assert_eq!(catalog.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally() {
        let gateway = DurableQueueGateway::new(broker())
            .register_lane(
                fast_lane("bulk-image", 2),
                processor_fn(|_: Value| async { Err(ItemError::abort("image host unreachable")) }),
            )
            .poll_interval(Duration::from_millis(5))
            .shutdown_when_queue_empty();
        let receipt = gateway
            .enqueue("bulk-image", OwnerId::new(), json!({ "items": ["https://x/1.png"] }))
            .await
            .unwrap();

        run_until_drained(&gateway).await;

        let status = gateway.get_status("bulk-image", receipt.job_id).await.unwrap();
        assert_eq!(status.state, QueueState::Failed);
        assert_eq!(status.attempts_made, 2);
        assert_eq!(status.failed_reason.as_deref(), Some("image host unreachable"));
        assert!(status.finished_at.is_some());
    }

    #[tokio::test]
    async fn start_recovers_stalled_jobs() {
        let broker = broker();
        let gateway = DurableQueueGateway::new(broker.clone())
            .register_lane(fast_lane("bulk-price", 3), processor_fn(|_: Value| async { Ok(()) }))
            .poll_interval(Duration::from_millis(5))
            .stall_timeout(Duration::from_millis(20))
            .shutdown_when_queue_empty();
        let receipt = gateway
            .enqueue("bulk-price", OwnerId::new(), json!({ "items": [1, 2, 3] }))
            .await
            .unwrap();
        // a previous process claimed the job and died
        broker.claim_next("bulk-price").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        run_until_drained(&gateway).await;

        let status = gateway.get_status("bulk-price", receipt.job_id).await.unwrap();
        assert_eq!(status.state, QueueState::Completed);
        assert_eq!(status.attempts_made, 2);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let gateway = DurableQueueGateway::new(broker())
            .register_lane(LaneConfig::bulk_price(), processor_fn(|_: Value| async { Ok(()) }))
            .poll_interval(Duration::from_secs(60));

        let handle = gateway.start().await.unwrap();
        assert_eq!(handle.worker_count(), 4);

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("idle workers should stop promptly");
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let gateway = DurableQueueGateway::new(broker())
            .register_lane(fast_lane("bulk-price", 1), processor_fn(|_: Value| async { Ok(()) }));

        let missing = JobId::new();
        let err = gateway.get_status("bulk-price", missing).await.unwrap_err();

        assert!(matches!(err, QueueError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn second_gateway_leaves_live_attempts_alone() {
        let broker = broker();
        let runs = Arc::new(AtomicU32::new(0));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let slow = {
            let (runs, started, release) = (runs.clone(), started.clone(), release.clone());
            processor_fn(move |_: Value| {
                let (runs, started, release) = (runs.clone(), started.clone(), release.clone());
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                }
            })
        };
        let first = DurableQueueGateway::new(broker.clone())
            .register_lane(fast_lane("bulk-image", 3), slow)
            .poll_interval(Duration::from_millis(5))
            .stall_timeout(Duration::from_millis(150));
        let receipt = first
            .enqueue("bulk-image", OwnerId::new(), json!({ "items": ["https://cdn/1.png"] }))
            .await
            .unwrap();
        let first_handle = first.start().await.unwrap();
        started.notified().await;

        // a second process starts up while the first attempt is running
        let duplicates = Arc::new(AtomicU32::new(0));
        let second = {
            let duplicates = duplicates.clone();
            DurableQueueGateway::new(broker.clone())
                .register_lane(
                    fast_lane("bulk-image", 3),
                    processor_fn(move |_: Value| {
                        let duplicates = duplicates.clone();
                        async move {
                            duplicates.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .poll_interval(Duration::from_millis(5))
                .stall_timeout(Duration::from_millis(150))
        };
        let second_handle = second.start().await.unwrap();

        // several stall timeouts pass while the lease is renewed
        tokio::time::sleep(Duration::from_millis(500)).await;
        let running = second.get_status("bulk-image", receipt.job_id).await.unwrap();
        assert_eq!(running.state, QueueState::Active);
        assert_eq!(running.attempts_made, 1);

        release.notify_one();
        wait_for_state(&first, "bulk-image", receipt.job_id, QueueState::Completed).await;
        first_handle.shutdown().await;
        second_handle.shutdown().await;

        let status = first.get_status("bulk-image", receipt.job_id).await.unwrap();
        assert_eq!(status.attempts_made, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(duplicates.load(Ordering::SeqCst), 0);
    }

    /// Broker whose first `complete` calls fail with a storage error.
    struct FlakyCompletion {
        inner: InMemoryQueueBroker,
        failures_left: AtomicU32,
        complete_calls: AtomicU32,
    }

    #[async_trait]
    impl QueueBroker for FlakyCompletion {
        async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
            self.inner.enqueue(job).await
        }
        async fn get(&self, lane: &str, job_id: JobId) -> Result<QueuedJob, QueueError> {
            self.inner.get(lane, job_id).await
        }
        async fn claim_next(&self, lane: &str) -> Result<Option<QueuedJob>, QueueError> {
            self.inner.claim_next(lane).await
        }
        async fn heartbeat(&self, job_id: JobId, attempt: u32) -> Result<(), QueueError> {
            self.inner.heartbeat(job_id, attempt).await
        }
        async fn report_progress(&self, job_id: JobId, attempt: u32, progress: u8) -> Result<(), QueueError> {
            self.inner.report_progress(job_id, attempt, progress).await
        }
        async fn complete(&self, job_id: JobId, attempt: u32, result: Value) -> Result<(), QueueError> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(QueueError::Storage("connection reset".into()));
            }
            self.inner.complete(job_id, attempt, result).await
        }
        async fn fail_attempt(
            &self,
            job_id: JobId,
            attempt: u32,
            reason: &str,
            retry_at: Option<DateTime<Utc>>,
        ) -> Result<(), QueueError> {
            self.inner.fail_attempt(job_id, attempt, reason, retry_at).await
        }
        async fn recover_stalled(&self, lane: &str, stall_timeout: Duration) -> Result<u64, QueueError> {
            self.inner.recover_stalled(lane, stall_timeout).await
        }
        async fn pending(&self, lane: &str) -> Result<u64, QueueError> {
            self.inner.pending(lane).await
        }
    }

    #[tokio::test]
    async fn failed_completion_write_is_retried() {
        let broker = Arc::new(FlakyCompletion {
            inner: InMemoryQueueBroker::new(),
            failures_left: AtomicU32::new(1),
            complete_calls: AtomicU32::new(0),
        });
        let gateway = DurableQueueGateway::new(broker.clone())
            .register_lane(fast_lane("bulk-price", 3), processor_fn(|_: Value| async { Ok(()) }))
            .poll_interval(Duration::from_millis(5))
            .shutdown_when_queue_empty();
        let receipt = gateway
            .enqueue("bulk-price", OwnerId::new(), json!({ "items": [1, 2] }))
            .await
            .unwrap();

        run_until_drained(&gateway).await;

        let status = gateway.get_status("bulk-price", receipt.job_id).await.unwrap();
        assert_eq!(status.state, QueueState::Completed);
        assert_eq!(status.attempts_made, 1);
        assert_eq!(broker.complete_calls.load(Ordering::SeqCst), 2);
    }
}
