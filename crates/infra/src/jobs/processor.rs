//! Caller-supplied item processors.

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Typed failure returned by an [`ItemProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    /// This item failed; the job records it and moves on.
    #[error("{0}")]
    Item(String),
    /// The job cannot continue (e.g. the catalog store went away).
    #[error("job aborted: {0}")]
    Abort(String),
}

impl ItemError {
    pub fn item(msg: impl Into<String>) -> Self {
        Self::Item(msg.into())
    }

    pub fn abort(msg: impl Into<String>) -> Self {
        Self::Abort(msg.into())
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, ItemError::Abort(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ItemError::Item(msg) | ItemError::Abort(msg) => msg,
        }
    }
}

impl From<anyhow::Error> for ItemError {
    fn from(err: anyhow::Error) -> Self {
        Self::Item(format!("{err:#}"))
    }
}

impl From<String> for ItemError {
    fn from(msg: String) -> Self {
        Self::Item(msg)
    }
}

impl From<&str> for ItemError {
    fn from(msg: &str) -> Self {
        Self::Item(msg.to_string())
    }
}

/// Processes one work item of a bulk job.
///
/// Implementations are called sequentially within one job. Processors used on
/// a durable lane must be idempotent: a retried job re-runs every item.
#[async_trait]
pub trait ItemProcessor<I>: Send + Sync
where
    I: Send + 'static,
{
    /// Apply the operation to one item.
    async fn process(&self, item: I) -> Result<(), ItemError>;

    /// Label used in the error log for the item at `index` (0-based).
    fn label(&self, index: usize, _item: &I) -> String {
        format!("item[{index}]")
    }

    /// Kind-specific progress fields (e.g. images downloaded so far), merged
    /// into the job's `extensions` after every item.
    fn progress_extensions(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

#[async_trait]
impl<I, P> ItemProcessor<I> for Arc<P>
where
    P: ItemProcessor<I> + ?Sized,
    I: Send + 'static,
{
    async fn process(&self, item: I) -> Result<(), ItemError> {
        (**self).process(item).await
    }

    fn label(&self, index: usize, item: &I) -> String {
        (**self).label(index, item)
    }

    fn progress_extensions(&self) -> BTreeMap<String, Value> {
        (**self).progress_extensions()
    }
}

/// Adapter turning an async closure into an [`ItemProcessor`].
pub struct FnProcessor<F, I> {
    f: F,
    _item: PhantomData<fn(I)>,
}

/// Wrap an async closure `Fn(I) -> Future<Output = Result<(), ItemError>>`.
pub fn processor_fn<F, Fut, I>(f: F) -> FnProcessor<F, I>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ItemError>> + Send,
    I: Send + 'static,
{
    FnProcessor {
        f,
        _item: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, I> ItemProcessor<I> for FnProcessor<F, I>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ItemError>> + Send,
    I: Send + 'static,
{
    async fn process(&self, item: I) -> Result<(), ItemError> {
        (self.f)(item).await
    }
}

/// Processor with a custom item label, e.g. the SKU of a listing.
pub struct Labelled<P, L> {
    inner: P,
    label: L,
}

impl<P, L> Labelled<P, L> {
    pub fn new<I>(inner: P, label: L) -> Self
    where
        P: ItemProcessor<I>,
        L: Fn(usize, &I) -> String + Send + Sync,
        I: Send + 'static,
    {
        Self { inner, label }
    }
}

#[async_trait]
impl<P, L, I> ItemProcessor<I> for Labelled<P, L>
where
    P: ItemProcessor<I>,
    L: Fn(usize, &I) -> String + Send + Sync,
    I: Send + 'static,
{
    async fn process(&self, item: I) -> Result<(), ItemError> {
        self.inner.process(item).await
    }

    fn label(&self, index: usize, item: &I) -> String {
        (self.label)(index, item)
    }

    fn progress_extensions(&self) -> BTreeMap<String, Value> {
        self.inner.progress_extensions()
    }
}
