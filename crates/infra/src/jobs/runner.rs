//! In-process background execution of bulk jobs.
//!
//! [`BackgroundRunner::submit`] records the job, spawns a detached tokio task
//! and returns the id right away. The task walks the items through the shared
//! item loop and folds every outcome into the registry record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{Instrument, error, info, info_span};

use bulkops_core::{JobId, OwnerId};

use super::item_loop::{LoopOutcome, LoopSettings, ProgressSink, SinkError, Tally, run_items};
use super::processor::ItemProcessor;
use super::registry::{JobRegistry, JobTicket, RegistryError};
use super::types::{Completion, ProgressDelta};

/// Default pause between batches.
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Default number of failures kept on the final record.
pub const DEFAULT_FINAL_ERROR_LIMIT: usize = 100;

/// Runner tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Sleep between batches. Zero only yields to the scheduler.
    pub batch_pause: Duration,
    /// First-N failures written by the terminal transition.
    pub final_error_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_pause: DEFAULT_BATCH_PAUSE,
            final_error_limit: DEFAULT_FINAL_ERROR_LIMIT,
        }
    }
}

/// Submission error. Per-item failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("no tokio runtime available to run the job")]
    NoRuntime,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Runs bulk jobs on detached tokio tasks.
#[derive(Clone)]
pub struct BackgroundRunner {
    registry: Arc<dyn JobRegistry>,
    config: RunnerConfig,
}

impl BackgroundRunner {
    pub fn new(registry: Arc<dyn JobRegistry>, config: RunnerConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start a bulk job and return its id without waiting for any item.
    ///
    /// A job without items is completed before this returns.
    pub fn submit<I, P>(
        &self,
        owner: OwnerId,
        kind: &str,
        items: Vec<I>,
        processor: P,
        batch_size: usize,
    ) -> Result<JobId, SubmitError>
    where
        I: Send + 'static,
        P: ItemProcessor<I> + 'static,
    {
        if batch_size == 0 {
            return Err(SubmitError::InvalidBatchSize);
        }
        let runtime = Handle::try_current().map_err(|_| SubmitError::NoRuntime)?;

        let total = items.len();
        let ticket = self.registry.create(owner, kind, total as u64)?;
        let job_id = ticket.id;
        info!(job_id = %job_id, owner = %owner, kind, total, "bulk job submitted");

        if items.is_empty() {
            let tally = Tally::default();
            self.registry.complete(job_id, completion(tally.summary(), tally))?;
            return Ok(job_id);
        }

        let settings = LoopSettings {
            batch_size,
            batch_pause: self.config.batch_pause,
            final_error_limit: self.config.final_error_limit,
        };
        let registry = self.registry.clone();
        let span = info_span!("bulk_job", job_id = %job_id, kind);
        runtime.spawn(drive(registry, ticket, items, processor, settings).instrument(span));

        Ok(job_id)
    }
}

async fn drive<I, P>(
    registry: Arc<dyn JobRegistry>,
    ticket: JobTicket,
    items: Vec<I>,
    processor: P,
    settings: LoopSettings,
) where
    I: Send + 'static,
    P: ItemProcessor<I>,
{
    let job_id = ticket.id;
    let sink = RegistrySink {
        registry: registry.as_ref(),
        job_id,
    };

    let outcome = run_items(
        items,
        &processor,
        &sink,
        Some(&ticket.cancellation),
        &settings,
    )
    .await;

    let recorded = match outcome {
        LoopOutcome::Completed(tally) => {
            info!(
                processed = tally.processed,
                succeeded = tally.succeeded,
                failed = tally.failed,
                "bulk job completed"
            );
            registry.complete(job_id, completion(tally.summary(), tally))
        }
        LoopOutcome::Cancelled(tally) => {
            info!(processed = tally.processed, total = tally.total, "bulk job cancelled");
            let summary = format!(
                "cancelled after {} of {} items ({} succeeded, {} failed)",
                tally.processed, tally.total, tally.succeeded, tally.failed
            );
            registry.mark_cancelled(job_id, completion(summary, tally))
        }
        LoopOutcome::Aborted { tally, reason } => {
            error!(processed = tally.processed, reason = %reason, "bulk job failed");
            registry.fail(job_id, &reason)
        }
    };

    if let Err(err) = recorded {
        error!(error = %err, "could not record bulk job outcome");
    }
}

fn completion(summary: String, tally: Tally) -> Completion {
    Completion {
        errors: Some(tally.into_first_errors()),
        summary: Some(summary),
        ..Default::default()
    }
}

struct RegistrySink<'a> {
    registry: &'a dyn JobRegistry,
    job_id: JobId,
}

#[async_trait]
impl ProgressSink for RegistrySink<'_> {
    async fn record(&self, _tally: &Tally, delta: ProgressDelta) -> Result<(), SinkError> {
        self.registry.update_progress(self.job_id, delta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use tokio::sync::{Notify, mpsc};

    use super::*;
    use crate::jobs::processor::{ItemError, Labelled, processor_fn};
    use crate::jobs::registry::{InMemoryJobRegistry, RetentionPolicy};
    use crate::jobs::types::{Completion, JobRecord, JobStatus, JobView};

    fn runner(registry: Arc<dyn JobRegistry>, batch_pause: Duration) -> BackgroundRunner {
        BackgroundRunner::new(
            registry,
            RunnerConfig {
                batch_pause,
                ..Default::default()
            },
        )
    }

    fn registry() -> Arc<dyn JobRegistry> {
        InMemoryJobRegistry::arc(RetentionPolicy::default())
    }

    async fn wait_terminal(registry: &dyn JobRegistry, job_id: JobId) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = registry.get(job_id).unwrap();
                let p = &record.progress;
                assert!(p.processed <= p.total);
                assert!(p.succeeded + p.failed <= p.processed);
                if record.status.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("job did not reach a terminal state")
    }

    #[tokio::test]
    async fn mixed_outcomes_over_several_batches() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::from_millis(1));
        let processor = Labelled::new(
            processor_fn(|row: u32| async move {
                if matches!(row, 10 | 75 | 200) {
                    Err(ItemError::item(format!("row {row} rejected")))
                } else {
                    Ok(())
                }
            }),
            |_: usize, row: &u32| format!("row {row}"),
        );

        let job_id = runner
            .submit(OwnerId::new(), "bulk.create", (1..=250).collect(), processor, 50)
            .unwrap();
        let record = wait_terminal(registry.as_ref(), job_id).await;

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress.total, 250);
        assert_eq!(record.progress.processed, 250);
        assert_eq!(record.progress.succeeded, 247);
        assert_eq!(record.progress.failed, 3);
        let labels: Vec<_> = record.progress.errors.iter().map(|e| e.item_label.as_str()).collect();
        assert_eq!(labels, vec!["row 10", "row 75", "row 200"]);
        assert!(record.completed_at.is_some());
        assert!(record.duration_seconds() > 0.0);
        assert_eq!(record.progress_percent(), 100);
    }

    #[tokio::test]
    async fn every_kth_item_failing_still_completes() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::ZERO);
        let processor = processor_fn(|n: u64| async move {
            if n % 7 == 0 {
                Err(ItemError::item("price below floor"))
            } else {
                Ok(())
            }
        });

        let job_id = runner
            .submit(OwnerId::new(), "bulk.price", (1..=100).collect(), processor, 10)
            .unwrap();
        let record = wait_terminal(registry.as_ref(), job_id).await;

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress.failed, 14);
        assert_eq!(record.progress.succeeded, 86);
        assert_eq!(
            record.progress.summary.as_deref(),
            Some("86 of 100 items succeeded, 14 failed")
        );
    }

    #[tokio::test]
    async fn zero_items_complete_inside_submit() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::ZERO);
        let processor = processor_fn(|_: u32| async { Ok(()) });

        let job_id = runner
            .submit(OwnerId::new(), "bulk.image", Vec::new(), processor, 10)
            .unwrap();

        let record = registry.get(job_id).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress.processed, 0);
        assert_eq!(record.progress_percent(), 100);
    }

    #[tokio::test]
    async fn cancellation_keeps_in_flight_item() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::ZERO);
        let attempts = Arc::new(AtomicU64::new(0));
        let release = Arc::new(Notify::new());
        let (reached_tx, mut reached_rx) = mpsc::unbounded_channel();

        let processor = {
            let attempts = attempts.clone();
            let release = release.clone();
            processor_fn(move |n: u32| {
                let attempts = attempts.clone();
                let release = release.clone();
                let reached_tx = reached_tx.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 5 {
                        let _ = reached_tx.send(());
                        release.notified().await;
                    }
                    Ok(())
                }
            })
        };

        let job_id = runner
            .submit(OwnerId::new(), "bulk.price", (1..=20).collect(), processor, 3)
            .unwrap();

        reached_rx.recv().await.unwrap();
        assert!(registry.request_cancel(job_id).unwrap());
        release.notify_one();

        let record = wait_terminal(registry.as_ref(), job_id).await;
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.progress.processed, 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert!(!registry.request_cancel(job_id).unwrap());
    }

    #[tokio::test]
    async fn abort_marks_job_failed() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::ZERO);
        let processor = processor_fn(|n: u32| async move {
            if n == 3 {
                Err(ItemError::abort("catalog store unreachable"))
            } else {
                Ok(())
            }
        });

        let job_id = runner
            .submit(OwnerId::new(), "bulk.create", vec![1, 2, 3, 4], processor, 2)
            .unwrap();
        let record = wait_terminal(registry.as_ref(), job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("catalog store unreachable"));
        assert_eq!(record.progress.processed, 2);
    }

    /// Image attacher reporting how many images it stored.
    #[derive(Default)]
    struct ImageAttacher {
        stored: AtomicU64,
    }

    #[async_trait]
    impl ItemProcessor<&'static str> for ImageAttacher {
        async fn process(&self, url: &'static str) -> Result<(), ItemError> {
            if url.ends_with(".gif") {
                return Err(ItemError::item("unsupported image format"));
            }
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn progress_extensions(&self) -> BTreeMap<String, serde_json::Value> {
            BTreeMap::from([(
                "images_stored".to_string(),
                serde_json::json!(self.stored.load(Ordering::SeqCst)),
            )])
        }
    }

    #[tokio::test]
    async fn processor_extensions_reach_the_view() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::ZERO);
        let urls = vec!["https://cdn/1.png", "https://cdn/2.gif", "https://cdn/3.jpg"];

        let job_id = runner
            .submit(OwnerId::new(), "bulk.image", urls, ImageAttacher::default(), 2)
            .unwrap();
        let record = wait_terminal(registry.as_ref(), job_id).await;

        let view = JobView::from(&record);
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.extensions["images_stored"], serde_json::json!(2));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["extensions"]["images_stored"], 2);
    }

    /// Registry whose progress merges start failing after a number of calls.
    struct FlakyRegistry {
        inner: InMemoryJobRegistry,
        healthy_updates: u64,
        updates: AtomicU64,
    }

    impl JobRegistry for FlakyRegistry {
        fn create(&self, owner: OwnerId, kind: &str, total: u64) -> Result<JobTicket, RegistryError> {
            self.inner.create(owner, kind, total)
        }
        fn get(&self, job_id: JobId) -> Result<JobRecord, RegistryError> {
            self.inner.get(job_id)
        }
        fn update_progress(&self, job_id: JobId, delta: ProgressDelta) -> Result<(), RegistryError> {
            if self.updates.fetch_add(1, Ordering::SeqCst) >= self.healthy_updates {
                return Err(RegistryError::Unavailable("disk quota exceeded".into()));
            }
            self.inner.update_progress(job_id, delta)
        }
        fn complete(&self, job_id: JobId, completion: Completion) -> Result<(), RegistryError> {
            self.inner.complete(job_id, completion)
        }
        fn fail(&self, job_id: JobId, reason: &str) -> Result<(), RegistryError> {
            self.inner.fail(job_id, reason)
        }
        fn mark_cancelled(&self, job_id: JobId, completion: Completion) -> Result<(), RegistryError> {
            self.inner.mark_cancelled(job_id, completion)
        }
        fn request_cancel(&self, job_id: JobId) -> Result<bool, RegistryError> {
            self.inner.request_cancel(job_id)
        }
        fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<JobRecord>, RegistryError> {
            self.inner.list_by_owner(owner)
        }
        fn list_by_kind_prefix(
            &self,
            owner: Option<OwnerId>,
            prefix: &str,
        ) -> Result<Vec<JobRecord>, RegistryError> {
            self.inner.list_by_kind_prefix(owner, prefix)
        }
        fn len(&self) -> Result<usize, RegistryError> {
            self.inner.len()
        }
    }

    #[tokio::test]
    async fn registry_failure_is_an_orchestration_failure() {
        let registry: Arc<dyn JobRegistry> = Arc::new(FlakyRegistry {
            inner: InMemoryJobRegistry::default(),
            healthy_updates: 3,
            updates: AtomicU64::new(0),
        });
        let runner = runner(registry.clone(), Duration::ZERO);
        let processor = processor_fn(|_: u32| async { Ok(()) });

        let job_id = runner
            .submit(OwnerId::new(), "bulk.create", (0..10).collect(), processor, 5)
            .unwrap();
        let record = wait_terminal(registry.as_ref(), job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.progress.processed, 3);
        let reason = record.failure_reason.unwrap();
        assert!(reason.contains("disk quota exceeded"), "{reason}");
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::ZERO);
        let processor = processor_fn(|_: u32| async { Ok(()) });

        let err = runner
            .submit(OwnerId::new(), "bulk.create", vec![1], processor, 0)
            .unwrap_err();

        assert!(matches!(err, SubmitError::InvalidBatchSize));
        assert_eq!(registry.len().unwrap(), 0);
    }

    #[test]
    fn submit_requires_a_runtime() {
        let registry = registry();
        let runner = runner(registry.clone(), Duration::ZERO);
        let processor = processor_fn(|_: u32| async { Ok(()) });

        let err = runner
            .submit(OwnerId::new(), "bulk.create", vec![1, 2], processor, 1)
            .unwrap_err();

        assert!(matches!(err, SubmitError::NoRuntime));
        assert_eq!(registry.len().unwrap(), 0);
    }
}
