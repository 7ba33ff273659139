//! Error taxonomy of the eventstore core.

use thiserror::Error;

/// Errors surfaced by the eventstore core and its persistence ports.
///
/// Every variant carries a stable short code (`EVS-…` for the core,
/// `IAM-…` for domain callers) that support tooling can grep for, and
/// maps to an i18n key via [`i18n_key`](EventStoreError::i18n_key).
/// The core never retries; callers should only consider retrying
/// [`Concurrency`](EventStoreError::Concurrency) and
/// [`Storage`](EventStoreError::Storage).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The search query is missing required fields.
    #[error("{code}: invalid search query: {message}")]
    InvalidQuery {
        code: &'static str,
        message: &'static str,
    },

    /// A domain rule rejected the command.
    #[error("{code}: precondition failed: {key}")]
    PreconditionFailed {
        code: &'static str,
        /// Domain-supplied i18n key, e.g. `Errors.Iam.MemberAlreadyExisting`.
        key: &'static str,
    },

    /// Optimistic-concurrency conflict on append.
    #[error(
        "{code}: concurrent modification of aggregate {aggregate_id}: \
         asserted sequence {asserted}, store is at {latest}"
    )]
    Concurrency {
        code: &'static str,
        aggregate_id: String,
        asserted: u64,
        latest: u64,
    },

    /// The underlying store failed.
    #[error("{code}: storage failure: {source}")]
    Storage {
        code: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No decoder is registered for the event type.
    #[error("{code}: no event decoder registered for {event_type:?}")]
    UnknownEventType {
        code: &'static str,
        event_type: String,
    },

    /// A registered decoder failed on the stored payload.
    #[error("{code}: decoding {event_type:?} failed: {source}")]
    Decode {
        code: &'static str,
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The store cannot honour the query.
    #[error("{code}: unsupported query: {message}")]
    Unsupported {
        code: &'static str,
        message: &'static str,
    },

    /// Cancellation was observed before the operation completed.
    #[error("{code}: operation cancelled")]
    Cancelled { code: &'static str },

    /// An invariant of the core was breached.
    #[error("{code}: internal: {message}")]
    Internal { code: &'static str, message: String },
}

impl EventStoreError {
    pub fn invalid_query(code: &'static str, message: &'static str) -> Self {
        Self::InvalidQuery { code, message }
    }

    pub fn precondition_failed(code: &'static str, key: &'static str) -> Self {
        Self::PreconditionFailed { code, key }
    }

    pub fn concurrency(
        code: &'static str,
        aggregate_id: impl Into<String>,
        asserted: u64,
        latest: u64,
    ) -> Self {
        Self::Concurrency {
            code,
            aggregate_id: aggregate_id.into(),
            asserted,
            latest,
        }
    }

    pub fn storage(
        code: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            code,
            source: Box::new(source),
        }
    }

    pub fn unknown_event_type(code: &'static str, event_type: impl Into<String>) -> Self {
        Self::UnknownEventType {
            code,
            event_type: event_type.into(),
        }
    }

    pub fn decode(
        code: &'static str,
        event_type: impl Into<String>,
        source: serde_json::Error,
    ) -> Self {
        Self::Decode {
            code,
            event_type: event_type.into(),
            source,
        }
    }

    pub fn unsupported(code: &'static str, message: &'static str) -> Self {
        Self::Unsupported { code, message }
    }

    pub fn cancelled(code: &'static str) -> Self {
        Self::Cancelled { code }
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: message.into(),
        }
    }

    /// The stable short code attached at the error's origin.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuery { code, .. }
            | Self::PreconditionFailed { code, .. }
            | Self::Concurrency { code, .. }
            | Self::Storage { code, .. }
            | Self::UnknownEventType { code, .. }
            | Self::Decode { code, .. }
            | Self::Unsupported { code, .. }
            | Self::Cancelled { code }
            | Self::Internal { code, .. } => code,
        }
    }

    /// The translation key the transport layer resolves for end users.
    pub fn i18n_key(&self) -> &'static str {
        match self {
            Self::InvalidQuery { .. } => "Errors.EventStore.InvalidQuery",
            Self::PreconditionFailed { key, .. } => key,
            Self::Concurrency { .. } => "Errors.EventStore.Concurrency",
            Self::Storage { .. } => "Errors.EventStore.Storage",
            Self::UnknownEventType { .. } => "Errors.EventStore.UnknownEventType",
            Self::Decode { .. } => "Errors.EventStore.Decode",
            Self::Unsupported { .. } => "Errors.EventStore.Unsupported",
            Self::Cancelled { .. } => "Errors.EventStore.Cancelled",
            Self::Internal { .. } => "Errors.EventStore.Internal",
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. } | Self::Storage { .. })
    }
}

/// Result type for eventstore operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
