//! Projection error types.

use thiserror::Error;

/// Errors that can occur while driving projections.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error surfaced by the eventstore core.
    #[error("event store error: {0}")]
    EventStore(#[from] eventstore::EventStoreError),

    /// The watermark store failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Another worker holds the watermark row; fail fast, do not queue.
    #[error("state row of projection {projection_name:?} is locked by another worker")]
    Locked {
        instance_id: String,
        projection_name: String,
    },
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
