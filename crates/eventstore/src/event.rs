//! Typed-event plumbing shared by the command and query sides.

use std::any::Any;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{EventStoreError, Result};
use crate::repository::StoredEvent;

/// Audit information about the actor producing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Editor {
    pub service: String,
    pub user: String,
}

impl Editor {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }
}

/// Header shared by every typed domain event.
///
/// Producer-built headers (via [`EventHeader::for_push`]) carry a zero
/// sequence and a provisional event date; both become authoritative only
/// once the append commits and the stored row is mapped back through
/// [`EventHeader::from_stored`].
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub sequence: u64,
    pub previous_sequence: u64,
    pub event_date: DateTime<Utc>,
    pub resource_owner: String,
    pub editor_service: String,
    pub editor_user: String,
}

impl EventHeader {
    /// Header for an event about to be pushed. The aggregate identity is
    /// filled in when the event is bound to an
    /// [`Aggregate`](crate::aggregate::Aggregate).
    pub fn for_push(event_type: impl Into<String>, editor: &Editor) -> Self {
        Self {
            aggregate_id: String::new(),
            aggregate_type: String::new(),
            event_type: event_type.into(),
            sequence: 0,
            previous_sequence: 0,
            event_date: Utc::now(),
            resource_owner: String::new(),
            editor_service: editor.service.clone(),
            editor_user: editor.user.clone(),
        }
    }

    /// Header carried by an event decoded from a committed row.
    pub fn from_stored(stored: &StoredEvent) -> Self {
        Self {
            aggregate_id: stored.aggregate_id.clone(),
            aggregate_type: stored.aggregate_type.clone(),
            event_type: stored.event_type.clone(),
            sequence: stored.sequence,
            previous_sequence: stored.previous_sequence,
            event_date: stored.event_date,
            resource_owner: stored.resource_owner.clone(),
            editor_service: stored.editor_service.clone(),
            editor_user: stored.editor_user.clone(),
        }
    }

    /// Placeholder header used as the serde default while decoding; the
    /// decoder overwrites it with [`EventHeader::from_stored`].
    pub fn empty() -> Self {
        Self {
            aggregate_id: String::new(),
            aggregate_type: String::new(),
            event_type: String::new(),
            sequence: 0,
            previous_sequence: 0,
            event_date: DateTime::<Utc>::MIN_UTC,
            resource_owner: String::new(),
            editor_service: String::new(),
            editor_user: String::new(),
        }
    }
}

/// A typed domain event.
///
/// Implementations are plain structs embedding an [`EventHeader`] next to
/// their payload fields. The push path serializes them through
/// [`payload`](DomainEvent::payload); the read path dispatches stored rows
/// through registered decoders and consumers downcast via
/// [`as_any`](DomainEvent::as_any).
pub trait DomainEvent: Any + Send + Sync + std::fmt::Debug {
    fn header(&self) -> &EventHeader;

    /// The payload to persist. Must serialize to a JSON object;
    /// `Ok(None)` is stored as SQL NULL.
    fn payload(&self) -> serde_json::Result<Option<Value>>;

    fn as_any(&self) -> &dyn Any;
}

/// Serializes and validates an event payload for the push path.
///
/// Top-level scalars and arrays are rejected; only objects (or nothing)
/// may be persisted.
pub(crate) fn event_data(event: &dyn DomainEvent) -> Result<Option<Value>> {
    let data = event
        .payload()
        .map_err(|err| EventStoreError::decode("EVS-fN5xq", &event.header().event_type, err))?;

    match data {
        None | Some(Value::Null) => Ok(None),
        Some(value) if value.is_object() => Ok(Some(value)),
        Some(value) => Err(EventStoreError::internal(
            "EVS-8oRja",
            format!(
                "payload of {:?} must be a JSON object, got {value}",
                event.header().event_type
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct PayloadEvent {
        header: EventHeader,
        data: Option<Value>,
    }

    impl PayloadEvent {
        fn new(data: Option<Value>) -> Self {
            Self {
                header: EventHeader::for_push("test.event", &Editor::new("svc", "usr")),
                data,
            }
        }
    }

    impl DomainEvent for PayloadEvent {
        fn header(&self) -> &EventHeader {
            &self.header
        }

        fn payload(&self) -> serde_json::Result<Option<Value>> {
            Ok(self.data.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn object_payload_is_accepted() {
        let event = PayloadEvent::new(Some(json!({"piff": "paff"})));
        let data = event_data(&event).unwrap();
        assert_eq!(data, Some(json!({"piff": "paff"})));
    }

    #[test]
    fn missing_payload_is_stored_as_null() {
        assert_eq!(event_data(&PayloadEvent::new(None)).unwrap(), None);
        assert_eq!(
            event_data(&PayloadEvent::new(Some(Value::Null))).unwrap(),
            None
        );
    }

    #[test]
    fn scalar_payload_is_rejected() {
        let err = event_data(&PayloadEvent::new(Some(json!("")))).unwrap_err();
        assert!(matches!(err, EventStoreError::Internal { .. }));
    }

    #[test]
    fn array_payload_is_rejected() {
        let err = event_data(&PayloadEvent::new(Some(json!([1, 2])))).unwrap_err();
        assert!(matches!(err, EventStoreError::Internal { .. }));
    }

    #[test]
    fn push_header_carries_editor_audit_fields() {
        let header = EventHeader::for_push("iam.member.added", &Editor::new("mgmt-api", "u1"));
        assert_eq!(header.event_type, "iam.member.added");
        assert_eq!(header.editor_service, "mgmt-api");
        assert_eq!(header.editor_user, "u1");
        assert_eq!(header.sequence, 0);
    }
}
