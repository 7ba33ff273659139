//! Command-side aggregates and the fold contracts shared by both sides.

use chrono::{DateTime, Utc};

use crate::Result;
use crate::event::DomainEvent;
use crate::query::SearchQueryBuilder;

/// Boundary of consistency: one entity's identity, its
/// optimistic-concurrency watermark, and the new events a command wants
/// to append.
pub struct Aggregate {
    id: String,
    aggregate_type: String,
    resource_owner: String,
    version: String,
    previous_sequence: u64,
    events: Vec<Box<dyn DomainEvent>>,
}

impl Aggregate {
    pub fn new(
        id: impl Into<String>,
        aggregate_type: impl Into<String>,
        resource_owner: impl Into<String>,
        version: impl Into<String>,
        previous_sequence: u64,
    ) -> Self {
        Self {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
            resource_owner: resource_owner.into(),
            version: version.into(),
            previous_sequence,
            events: Vec::new(),
        }
    }

    /// Builds an aggregate positioned at a write-model's watermark.
    pub fn from_write_model(
        model: &WriteModel,
        aggregate_type: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self::new(
            model.aggregate_id.clone(),
            aggregate_type,
            model.resource_owner.clone(),
            version,
            model.processed_sequence,
        )
    }

    /// Builds an aggregate positioned at a read-model's watermark.
    pub fn from_read_model(
        model: &ReadModel,
        aggregate_type: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self::new(
            model.aggregate_id.clone(),
            aggregate_type,
            model.resource_owner.clone(),
            version,
            model.processed_sequence,
        )
    }

    /// Appends a pending event, preserving push order.
    pub fn push_event(mut self, event: impl DomainEvent) -> Self {
        self.events.push(Box::new(event));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn resource_owner(&self) -> &str {
        &self.resource_owner
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Sequence of the last event the producer observed; the
    /// optimistic-concurrency token.
    pub fn previous_sequence(&self) -> u64 {
        self.previous_sequence
    }

    pub fn events(&self) -> &[Box<dyn DomainEvent>] {
        &self.events
    }

    pub(crate) fn into_events(self) -> Vec<Box<dyn DomainEvent>> {
        self.events
    }
}

/// One-shot fold over a finite, mapped event stream.
///
/// `append_events` buffers or applies mapped events; `reduce` finalises
/// the state. Both are CPU-only. Models may be re-folded: `append_events`
/// must be additive and watermark-aware, ignoring events at or below the
/// last processed sequence.
pub trait Fold: Send {
    fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) -> Result<()>;

    fn reduce(&mut self) -> Result<()>;
}

/// A fold that knows the query reconstructing its own state.
pub trait QueryFold: Fold {
    fn query(&self) -> SearchQueryBuilder;
}

/// Base state for command-side write models.
///
/// Embedders forward `append_events` here and fold the buffered
/// [`events`](WriteModel::events) in their own `reduce` before calling
/// [`WriteModel::reduce`] to advance the watermark.
#[derive(Default)]
pub struct WriteModel {
    pub aggregate_id: String,
    pub processed_sequence: u64,
    pub resource_owner: String,
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl WriteModel {
    pub fn new(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            ..Self::default()
        }
    }

    /// Buffers mapped events, skipping anything at or below the
    /// processed-sequence watermark.
    pub fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) {
        for event in events {
            if event.header().sequence > self.processed_sequence || event.header().sequence == 0 {
                self.events.push(event);
            }
        }
    }

    /// Advances the watermark to the last buffered event and clears the
    /// buffer.
    pub fn reduce(&mut self) -> Result<()> {
        if let Some(last) = self.events.last() {
            self.processed_sequence = last.header().sequence;
            if self.resource_owner.is_empty() {
                self.resource_owner = last.header().resource_owner.clone();
            }
        }
        self.events.clear();
        Ok(())
    }
}

/// Base state for query-side read models; additionally tracks creation
/// and last-change timestamps.
#[derive(Debug, Default)]
pub struct ReadModel {
    pub aggregate_id: String,
    pub processed_sequence: u64,
    pub creation_date: Option<DateTime<Utc>>,
    pub change_date: Option<DateTime<Utc>>,
    pub resource_owner: String,
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl ReadModel {
    pub fn new(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            ..Self::default()
        }
    }

    /// Buffers mapped events, skipping anything at or below the
    /// processed-sequence watermark.
    pub fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) {
        for event in events {
            if event.header().sequence > self.processed_sequence || event.header().sequence == 0 {
                self.events.push(event);
            }
        }
    }

    /// Advances watermark and timestamps from the buffered events and
    /// clears the buffer.
    pub fn reduce(&mut self) -> Result<()> {
        if let Some(first) = self.events.first()
            && self.creation_date.is_none()
        {
            self.creation_date = Some(first.header().event_date);
        }
        if let Some(last) = self.events.last() {
            self.processed_sequence = last.header().sequence;
            self.change_date = Some(last.header().event_date);
            if self.resource_owner.is_empty() {
                self.resource_owner = last.header().resource_owner.clone();
            }
        }
        self.events.clear();
        Ok(())
    }
}
