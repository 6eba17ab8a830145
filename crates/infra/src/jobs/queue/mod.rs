//! Durable queue execution path.
//!
//! Jobs are persisted by a [`QueueBroker`] and executed by lane workers
//! started from a [`DurableQueueGateway`]. Each lane has its own worker pool
//! and whole-job retry policy; a job that fails an attempt re-runs every item
//! on the next one.
//!
//! A claimed attempt holds a lease that its worker renews while it runs.
//! Only jobs whose lease went stale are recovered, and every write of an
//! attempt is rejected with [`QueueError::LeaseLost`] once another attempt
//! owns the job.
//!
//! Progress is tracked by the broker as a percentage. Durable jobs are never
//! registered in the [`JobRegistry`](crate::jobs::JobRegistry) and cannot be
//! cancelled cooperatively.

pub mod broker;
pub mod gateway;
pub mod in_memory;
pub mod lane;
pub mod postgres;
pub mod types;
mod worker;

pub use broker::{QueueBroker, QueueError};
pub use gateway::{DurableQueueGateway, GatewayHandle};
pub use in_memory::InMemoryQueueBroker;
pub use lane::{BULK_CREATE, BULK_IMAGE, BULK_PRICE, LaneConfig};
pub use postgres::PostgresQueueBroker;
pub use types::{EnqueueReceipt, LaneJobResult, QueueJobStatus, QueueState, QueuedJob};
