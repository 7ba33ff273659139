//! Persistence port for the append-only event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::query::SearchQuery;

/// Producer-side record handed to the store by a push.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// Version tag of the aggregate's event schema, e.g. `"v1"`.
    pub aggregate_version: String,
    pub event_type: String,
    /// Sequence of the last event the producer observed. `0` together
    /// with `check_previous` asserts the aggregate has no events yet.
    pub previous_sequence: u64,
    /// Whether the store must verify `previous_sequence` against the
    /// aggregate's latest committed sequence. Per aggregate, the lowest
    /// asserted `previous_sequence` in a batch is the effective one.
    pub check_previous: bool,
    pub resource_owner: String,
    pub editor_service: String,
    pub editor_user: String,
    /// JSON object payload; `None` is stored as SQL NULL.
    pub data: Option<Value>,
    /// Index of the prior event of the same batch, independent of
    /// aggregate. Stores that assign sequences by walking the chain use
    /// it; stores that assign by row insertion may ignore it.
    pub previous_event: Option<usize>,
}

/// A committed event row. `sequence` and `event_date` are assigned by the
/// store and authoritative; everything else is producer-supplied.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub aggregate_version: String,
    pub event_type: String,
    pub sequence: u64,
    pub previous_sequence: u64,
    pub event_date: DateTime<Utc>,
    pub resource_owner: String,
    pub editor_service: String,
    pub editor_user: String,
    pub data: Option<Value>,
}

/// Storage-agnostic persistence port, the sole I/O seam of the core.
///
/// Implementations must be safe for concurrent use. Cancellation of any
/// operation surfaces as [`EventStoreError::Cancelled`]; a cancelled
/// `push` leaves the log consistent: either the batch committed before
/// cancellation or not at all.
///
/// [`EventStoreError::Cancelled`]: crate::EventStoreError::Cancelled
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Verifies the store is reachable.
    async fn health(&self, cancel: &CancellationToken) -> Result<()>;

    /// Atomically appends an ordered, heterogeneous batch.
    ///
    /// Either every event becomes visible, with strictly ascending
    /// sequences in commit order, or none does. A failed
    /// previous-sequence assertion yields
    /// [`EventStoreError::Concurrency`]; any other store failure yields
    /// [`EventStoreError::Storage`]. The order of events as supplied is
    /// preserved in the log. Returns the committed rows.
    ///
    /// [`EventStoreError::Concurrency`]: crate::EventStoreError::Concurrency
    /// [`EventStoreError::Storage`]: crate::EventStoreError::Storage
    async fn push(
        &self,
        cancel: &CancellationToken,
        events: Vec<PushEvent>,
    ) -> Result<Vec<StoredEvent>>;

    /// Returns the events matching `query`, ordered by sequence
    /// (ascending unless the query says otherwise).
    async fn filter(
        &self,
        cancel: &CancellationToken,
        query: &SearchQuery,
    ) -> Result<Vec<StoredEvent>>;

    /// Returns the highest sequence among matching events, or `0`.
    /// Must be a cheap index-only probe.
    async fn latest_sequence(
        &self,
        cancel: &CancellationToken,
        query: &SearchQuery,
    ) -> Result<u64>;
}
