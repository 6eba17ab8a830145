//! Engine configuration loaded from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BULKOPS_JOB_CAPACITY` | 100 |
//! | `BULKOPS_JOB_MAX_AGE_SECS` | unset (no age pruning) |
//! | `BULKOPS_BATCH_PAUSE_MS` | 100 |
//! | `BULKOPS_ERROR_LOG_LIMIT` | 50 |
//! | `BULKOPS_FINAL_ERROR_LIMIT` | 100 |
//! | `BULKOPS_QUEUE_POLL_MS` | 500 |
//! | `BULKOPS_QUEUE_STALL_SECS` | 30 |
//! | `DATABASE_URL` | unset (in-memory queue broker) |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::jobs::queue::gateway::{DEFAULT_POLL_INTERVAL, DEFAULT_STALL_TIMEOUT};
use crate::jobs::queue::{
    DurableQueueGateway, InMemoryQueueBroker, PostgresQueueBroker, QueueBroker, QueueError,
};
use crate::jobs::registry::{DEFAULT_ERROR_LOG_LIMIT, InMemoryJobRegistry, RetentionPolicy};
use crate::jobs::runner::{BackgroundRunner, RunnerConfig};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Durable queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    /// Lease age after which an active job is re-queued.
    pub stall_timeout: Duration,
    /// Postgres broker when set, in-memory broker otherwise.
    pub database_url: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            database_url: None,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retention: RetentionPolicy,
    /// Bound of the trailing per-job error log kept while a job runs.
    pub error_log_limit: usize,
    pub runner: RunnerConfig,
    pub queue: QueueSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            error_log_limit: DEFAULT_ERROR_LOG_LIMIT,
            runner: RunnerConfig::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(capacity) = parse::<usize>(&lookup, "BULKOPS_JOB_CAPACITY")? {
            if capacity == 0 {
                return Err(invalid("BULKOPS_JOB_CAPACITY", "0"));
            }
            config.retention.capacity = capacity;
        }
        if let Some(secs) = parse::<u64>(&lookup, "BULKOPS_JOB_MAX_AGE_SECS")? {
            config.retention.max_age = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = parse::<u64>(&lookup, "BULKOPS_BATCH_PAUSE_MS")? {
            config.runner.batch_pause = Duration::from_millis(ms);
        }
        if let Some(limit) = parse(&lookup, "BULKOPS_ERROR_LOG_LIMIT")? {
            config.error_log_limit = limit;
        }
        if let Some(limit) = parse(&lookup, "BULKOPS_FINAL_ERROR_LIMIT")? {
            config.runner.final_error_limit = limit;
        }
        if let Some(ms) = parse::<u64>(&lookup, "BULKOPS_QUEUE_POLL_MS")? {
            config.queue.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "BULKOPS_QUEUE_STALL_SECS")? {
            if secs == 0 {
                return Err(invalid("BULKOPS_QUEUE_STALL_SECS", "0"));
            }
            config.queue.stall_timeout = Duration::from_secs(secs);
        }
        config.queue.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        Ok(config)
    }

    fn registry(&self) -> Arc<InMemoryJobRegistry> {
        Arc::new(
            InMemoryJobRegistry::new(self.retention.clone())
                .with_error_log_limit(self.error_log_limit),
        )
    }

    /// Build a runner over a fresh registry.
    ///
    /// Every call builds a new registry; share the runner (it is `Clone`) and
    /// reach its registry through [`BackgroundRunner::registry`].
    pub fn runner(&self) -> BackgroundRunner {
        BackgroundRunner::new(self.registry(), self.runner.clone())
    }

    /// Build a gateway over `broker` with the configured poll interval, stall
    /// timeout and final error limit. Lanes are registered by the caller.
    pub fn gateway(&self, broker: Arc<dyn QueueBroker>) -> DurableQueueGateway {
        DurableQueueGateway::new(broker)
            .poll_interval(self.queue.poll_interval)
            .stall_timeout(self.queue.stall_timeout)
            .final_error_limit(self.runner.final_error_limit)
    }

    /// Queue broker selected by `DATABASE_URL`.
    ///
    /// The Postgres broker creates its table if needed.
    pub async fn queue_broker(&self) -> Result<Arc<dyn QueueBroker>, QueueError> {
        match &self.queue.database_url {
            Some(url) => {
                let broker = PostgresQueueBroker::connect(url).await?;
                broker.ensure_schema().await?;
                info!("using postgres queue broker");
                Ok(Arc::new(broker))
            }
            None => {
                info!("using in-memory queue broker");
                Ok(Arc::new(InMemoryQueueBroker::new()))
            }
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &raw)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}
