use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;
use umbrette_core::error::RelayError;
use umbrette_core::nostr::RawEvent;

use crate::filters::Filter;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Lazy, finite sequence of matching events. Consumed once; restarting means
/// issuing a new query.
pub type EventStream = BoxStream<'static, Result<RawEvent, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Tagged rejection whose reason goes to the client verbatim.
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// The query could not complete within its allotted time.
    #[error("query timed out")]
    Timeout,
    #[error("storage failure: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug)]
pub struct QueryOptions {
    /// Hard cap on results, applied over whatever the filters ask for.
    pub limit: usize,
    /// Bound on the whole query, including consumption of the stream.
    pub timeout: Duration,
}

/// Durable event storage plus filter-query execution. The only resource
/// shared across connections; implementations own their concurrency safety.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Execute a filter query and stream matching events. Order is the
    /// store's to choose and is preserved downstream.
    async fn query(&self, filters: Vec<Filter>, options: QueryOptions)
        -> Result<EventStream, StoreError>;

    /// Validate and persist one event. A `StoreError::Relay` explains the
    /// rejection in wire form; anything else is an opaque failure.
    async fn save(&self, event: &RawEvent) -> Result<(), StoreError>;

    /// Count matching events. Single-shot, not cancelable.
    async fn count(&self, filters: Vec<Filter>) -> Result<u64, StoreError>;

    /// Readiness probe for the health endpoint.
    async fn ready(&self) -> Result<(), StoreError>;
}
