//! Named lane configuration.

use std::time::Duration;

use crate::jobs::types::RetryPolicy;

pub const BULK_CREATE: &str = "bulk-create";
pub const BULK_PRICE: &str = "bulk-price";
pub const BULK_IMAGE: &str = "bulk-image";

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Configuration of one queue lane.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneConfig {
    pub name: String,
    /// Number of workers, i.e. jobs of this lane running at once.
    pub concurrency: usize,
    /// Whole-job retry policy; `max_attempts` is copied onto every enqueued job.
    pub retry: RetryPolicy,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl LaneConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pause: DEFAULT_BATCH_PAUSE,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_pause(mut self, batch_pause: Duration) -> Self {
        self.batch_pause = batch_pause;
        self
    }

    /// Record creation (brands, products, listings).
    pub fn bulk_create() -> Self {
        Self::new(BULK_CREATE)
            .concurrency(2)
            .retry(RetryPolicy::exponential(
                3,
                Duration::from_secs(2),
                Duration::from_secs(60),
            ))
    }

    /// Repricing. Cheap per item, so more workers and bigger batches.
    pub fn bulk_price() -> Self {
        Self::new(BULK_PRICE)
            .concurrency(4)
            .batch_size(100)
            .retry(RetryPolicy::exponential(
                3,
                Duration::from_secs(1),
                Duration::from_secs(30),
            ))
    }

    /// Image attachment. Items hit remote hosts, so small batches and more
    /// patient retries.
    pub fn bulk_image() -> Self {
        Self::new(BULK_IMAGE)
            .concurrency(2)
            .batch_size(10)
            .batch_pause(Duration::from_millis(250))
            .retry(RetryPolicy::exponential(
                5,
                Duration::from_secs(5),
                Duration::from_secs(300),
            ))
    }

    pub fn builtins() -> Vec<Self> {
        vec![Self::bulk_create(), Self::bulk_price(), Self::bulk_image()]
    }
}
