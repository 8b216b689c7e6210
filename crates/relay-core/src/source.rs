//! Upstream item source.
//!
//! The upstream offers two legs for a query: a one-shot historical search and
//! a long-lived live stream. [`ItemSource::open`] joins them into a single
//! [`LogicalSequence`]: the first [`HISTORY_LIMIT`] historical results, then
//! every live item, in order and without interleaving.

use crate::item::Item;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::{debug, info};

/// Maximum number of historical results replayed into the sequence.
pub const HISTORY_LIMIT: usize = 10;

/// Upstream errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The upstream could not be reached or rejected the request.
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// The upstream returned a record that could not be decoded.
    #[error("Malformed upstream record: {0}")]
    Decode(String),

    /// The requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl SourceError {
    /// Collapse any failure into [`SourceError::Unavailable`].
    #[must_use]
    pub fn into_unavailable(self) -> Self {
        match self {
            SourceError::Unavailable(_) => self,
            other => SourceError::Unavailable(other.to_string()),
        }
    }
}

/// A live push sequence of items.
pub type LiveStream = BoxStream<'static, Result<Item, SourceError>>;

/// The external search/stream API.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Run a one-shot search and return results in upstream order.
    async fn historical_search(&self, query: &str) -> Result<Vec<Item>, SourceError>;

    /// Open the live stream of items matching `query`.
    async fn open_live_stream(&self, query: &str) -> Result<LiveStream, SourceError>;
}

/// A lazily started, single-consumer sequence of items.
///
/// The sequence ends after yielding its first error.
pub struct LogicalSequence {
    inner: BoxStream<'static, Result<Item, SourceError>>,
    failed: bool,
}

impl LogicalSequence {
    /// Wrap an arbitrary stream.
    #[must_use]
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Item, SourceError>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            failed: false,
        }
    }
}

impl Stream for LogicalSequence {
    type Item = Result<Item, SourceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.failed {
            return Poll::Ready(None);
        }
        let next = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(Err(_))) = &next {
            self.failed = true;
        }
        next
    }
}

impl fmt::Debug for LogicalSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalSequence")
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

/// Adapter turning an [`Upstream`] into logical sequences.
#[derive(Clone)]
pub struct ItemSource {
    upstream: Arc<dyn Upstream>,
}

impl ItemSource {
    /// Create a new source.
    #[must_use]
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    /// Build the logical sequence for `query`.
    ///
    /// Nothing is requested from the upstream until the sequence is first
    /// polled. Both legs are then opened concurrently; a failure of either
    /// surfaces as a single [`SourceError::Unavailable`].
    #[must_use]
    pub fn open(&self, query: impl Into<String>) -> LogicalSequence {
        let upstream = Arc::clone(&self.upstream);
        let query = query.into();

        let legs = async move {
            debug!(query = %query, "Opening upstream legs");

            let (history, live) = tokio::try_join!(
                upstream.historical_search(&query),
                upstream.open_live_stream(&query),
            )
            .map_err(SourceError::into_unavailable)?;

            info!(
                query = %query,
                historical = history.len().min(HISTORY_LIMIT),
                "Upstream established"
            );

            let history = stream::iter(history.into_iter().take(HISTORY_LIMIT).map(Ok));
            let live = live.map_err(SourceError::into_unavailable);
            Ok::<_, SourceError>(history.chain(live))
        };

        LogicalSequence::from_stream(stream::once(legs).try_flatten())
    }
}

impl fmt::Debug for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemSource").finish_non_exhaustive()
    }
}
