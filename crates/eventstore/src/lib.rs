//! Append-only event log with the aggregate, write-model and read-model
//! machinery built on top of it.
//!
//! Authorisation state is not stored as mutable rows: it is reconstructed
//! by folding an ordered stream of immutable events. This crate holds the
//! storage-agnostic core: the persistence port, the search-query builder,
//! the decoder registry and the [`Eventstore`] facade driving commands
//! and folds. Domain crates sit on top and register their event decoders
//! per type.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod eventstore;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod registry;
pub mod repository;

pub use aggregate::{Aggregate, Fold, QueryFold, ReadModel, WriteModel};
pub use error::{EventStoreError, Result};
pub use event::{DomainEvent, Editor, EventHeader};
pub use eventstore::Eventstore;
pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use query::{Columns, Ordering, SearchQuery, SearchQueryBuilder};
pub use registry::{EventDecoder, EventRegistry, decoder};
pub use repository::{EventRepository, PushEvent, StoredEvent};
