//! Declarative filter composition over the event log.

use serde_json::{Map, Value};

use crate::error::{EventStoreError, Result};

/// Column set a query projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Columns {
    /// Full event rows.
    #[default]
    Event,
    /// A single max-sequence probe; must stay index-only in the store.
    MaxSequence,
}

/// Result ordering by sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ordering {
    #[default]
    Ascending,
    Descending,
}

/// Fluent builder producing an immutable [`SearchQuery`].
///
/// Predicates combine with AND; within one predicate, multiple values
/// combine with OR. At least one aggregate type is required.
///
/// ```
/// use eventstore::SearchQueryBuilder;
///
/// let query = SearchQueryBuilder::new(["iam"])
///     .aggregate_ids(["iam-1"])
///     .sequence_greater(12)
///     .limit(100)
///     .build()
///     .unwrap();
/// assert_eq!(query.aggregate_types, vec!["iam".to_owned()]);
/// ```
#[derive(Debug, Clone)]
pub struct SearchQueryBuilder {
    columns: Columns,
    aggregate_types: Vec<String>,
    aggregate_ids: Vec<String>,
    event_types: Vec<String>,
    resource_owners: Vec<String>,
    event_data: Option<Map<String, Value>>,
    sequence_greater: u64,
    sequence_at_most: Option<u64>,
    ordering: Ordering,
    limit: Option<u64>,
}

impl SearchQueryBuilder {
    /// Starts a query over the given aggregate types.
    pub fn new(aggregate_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: Columns::Event,
            aggregate_types: aggregate_types.into_iter().map(Into::into).collect(),
            aggregate_ids: Vec::new(),
            event_types: Vec::new(),
            resource_owners: Vec::new(),
            event_data: None,
            sequence_greater: 0,
            sequence_at_most: None,
            ordering: Ordering::Ascending,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: Columns) -> Self {
        self.columns = columns;
        self
    }

    /// Restricts to the given aggregate ids (OR within).
    pub fn aggregate_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.aggregate_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts to the given event types (OR within).
    pub fn event_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts to a resource owner; repeatable (OR within).
    pub fn resource_owner(mut self, owner: impl Into<String>) -> Self {
        self.resource_owners.push(owner.into());
        self
    }

    /// Matches key/value pairs inside the JSON payload. Keys referencing
    /// nested values use dotted paths (`"config.clientId"`). Stores
    /// without JSON support reject such queries with `Unsupported`.
    pub fn event_data(mut self, data: Map<String, Value>) -> Self {
        self.event_data = Some(data);
        self
    }

    /// Strict lower sequence bound: only events with a sequence greater
    /// than `sequence` match.
    pub fn sequence_greater(mut self, sequence: u64) -> Self {
        self.sequence_greater = sequence;
        self
    }

    /// Inclusive upper sequence bound.
    pub fn sequence_at_most(mut self, sequence: u64) -> Self {
        self.sequence_at_most = Some(sequence);
        self
    }

    pub fn order_desc(mut self) -> Self {
        self.ordering = Ordering::Descending;
        self
    }

    pub fn order_asc(mut self) -> Self {
        self.ordering = Ordering::Ascending;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validates and freezes the query. Fails with `InvalidQuery` when no
    /// aggregate type is set; the store is never contacted for an invalid
    /// query.
    pub fn build(self) -> Result<SearchQuery> {
        if self.aggregate_types.is_empty() || self.aggregate_types.iter().any(String::is_empty) {
            return Err(EventStoreError::invalid_query(
                "EVS-m9Xsd",
                "at least one non-empty aggregate type is required",
            ));
        }

        Ok(SearchQuery {
            columns: self.columns,
            aggregate_types: self.aggregate_types,
            aggregate_ids: self.aggregate_ids,
            event_types: self.event_types,
            resource_owners: self.resource_owners,
            event_data: self.event_data,
            sequence_greater: self.sequence_greater,
            sequence_at_most: self.sequence_at_most,
            ordering: self.ordering,
            limit: self.limit,
        })
    }
}

/// Immutable, validated filter handed to the persistence port.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub columns: Columns,
    pub aggregate_types: Vec<String>,
    pub aggregate_ids: Vec<String>,
    pub event_types: Vec<String>,
    pub resource_owners: Vec<String>,
    pub event_data: Option<Map<String, Value>>,
    /// Strict lower bound; `0` means unbounded.
    pub sequence_greater: u64,
    /// Inclusive upper bound.
    pub sequence_at_most: Option<u64>,
    pub ordering: Ordering,
    pub limit: Option<u64>,
}
