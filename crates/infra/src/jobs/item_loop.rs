//! The per-job item loop shared by the background runner and lane workers.
//!
//! Items are attempted strictly in submission order, one at a time. After
//! every item the outcome is pushed to a [`ProgressSink`]; between batches the
//! loop sleeps so the rest of the process (and whatever the processor talks
//! to) gets room to breathe.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::processor::{ItemError, ItemProcessor};
use super::types::{ItemFailure, ProgressDelta};

/// Destination of per-item progress.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called once per attempted item with the running tally and the delta.
    async fn record(&self, tally: &Tally, delta: ProgressDelta) -> Result<(), SinkError>;
}

/// Progress could not be recorded; the job is aborted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl From<super::registry::RegistryError> for SinkError {
    fn from(err: super::registry::RegistryError) -> Self {
        Self(err.to_string())
    }
}

/// Loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    /// Items per batch (non-zero).
    pub batch_size: usize,
    /// Pause between batches; zero only yields.
    pub batch_pause: Duration,
    /// Number of failures kept for the final result (first N).
    pub final_error_limit: usize,
}

/// Running counters of one job attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    first_errors: Vec<ItemFailure>,
    final_error_limit: usize,
}

impl Tally {
    fn new(total: usize, final_error_limit: usize) -> Self {
        Self {
            total: total as u64,
            final_error_limit,
            ..Default::default()
        }
    }

    /// The first `final_error_limit` failures, in item order.
    pub fn first_errors(&self) -> &[ItemFailure] {
        &self.first_errors
    }

    pub fn into_first_errors(self) -> Vec<ItemFailure> {
        self.first_errors
    }

    /// `round(processed / total * 100)`; 100 for an empty job.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed as f64 / self.total as f64) * 100.0).round() as u8
    }

    pub fn summary(&self) -> String {
        format!(
            "{} of {} items succeeded, {} failed",
            self.succeeded, self.total, self.failed
        )
    }

    fn record_failure(&mut self, failure: &ItemFailure) {
        self.failed += 1;
        if self.first_errors.len() < self.final_error_limit {
            self.first_errors.push(failure.clone());
        }
    }
}

/// How an item loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    /// Every item was attempted.
    Completed(Tally),
    /// The cancellation token was observed at a checkpoint.
    Cancelled(Tally),
    /// The processor aborted or progress could not be recorded.
    Aborted { tally: Tally, reason: String },
}

impl LoopOutcome {
    pub fn tally(&self) -> &Tally {
        match self {
            LoopOutcome::Completed(t) | LoopOutcome::Cancelled(t) => t,
            LoopOutcome::Aborted { tally, .. } => tally,
        }
    }
}

/// Drive `items` through `processor`, reporting to `sink` after every item.
///
/// `cancellation` is checked before each item and once after the last one.
/// An in-flight `process` call is never interrupted: the item it works on
/// finishes and is counted.
pub async fn run_items<I, P, S>(
    items: Vec<I>,
    processor: &P,
    sink: &S,
    cancellation: Option<&CancellationToken>,
    settings: &LoopSettings,
) -> LoopOutcome
where
    I: Send + 'static,
    P: ItemProcessor<I> + ?Sized,
    S: ProgressSink + ?Sized,
{
    let batch_size = settings.batch_size.max(1);
    let mut tally = Tally::new(items.len(), settings.final_error_limit);

    for (index, item) in items.into_iter().enumerate() {
        if index > 0 && index % batch_size == 0 {
            pause(settings.batch_pause).await;
        }

        if cancellation.is_some_and(CancellationToken::is_cancelled) {
            return LoopOutcome::Cancelled(tally);
        }

        let label = processor.label(index, &item);
        let result = AssertUnwindSafe(processor.process(item))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ItemError::Item(panic_message(&*panic))));

        let mut delta = match result {
            Ok(()) => {
                tally.succeeded += 1;
                ProgressDelta::success()
            }
            Err(ItemError::Item(message)) => {
                warn!(item = %label, error = %message, "bulk item failed");
                let failure = ItemFailure::new(label, message);
                tally.record_failure(&failure);
                ProgressDelta::failure(failure)
            }
            Err(ItemError::Abort(reason)) => {
                return LoopOutcome::Aborted { tally, reason };
            }
        };
        tally.processed += 1;
        delta.extensions = processor.progress_extensions();

        if let Err(err) = sink.record(&tally, delta).await {
            return LoopOutcome::Aborted {
                tally,
                reason: format!("progress update failed: {err}"),
            };
        }
    }

    // a cancel accepted while the last item was in flight
    if cancellation.is_some_and(CancellationToken::is_cancelled) {
        return LoopOutcome::Cancelled(tally);
    }

    LoopOutcome::Completed(tally)
}

async fn pause(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("processor panicked: {msg}")
}
