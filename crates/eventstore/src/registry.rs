//! Decoder registry mapping persisted event types to typed events.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::Result;
use crate::error::EventStoreError;
use crate::event::DomainEvent;
use crate::repository::StoredEvent;

/// Decodes one stored row into a typed domain event.
pub type EventDecoder = Arc<dyn Fn(&StoredEvent) -> Result<Box<dyn DomainEvent>> + Send + Sync>;

/// Wraps a decoder function for registration.
pub fn decoder<F>(f: F) -> EventDecoder
where
    F: Fn(&StoredEvent) -> Result<Box<dyn DomainEvent>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Registry of event decoders, keyed by event type.
///
/// Each [`Eventstore`](crate::Eventstore) owns one registry, so test
/// harnesses run isolated registries in parallel. Reads dominate writes;
/// writes happen during lazy module init.
#[derive(Default)]
pub struct EventRegistry {
    decoders: RwLock<HashMap<String, EventDecoder>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `decoder` for `event_type`, replacing any existing
    /// registration. An empty type name or a `None` decoder is silently
    /// ignored so domain crates can declare decoder tables conditionally.
    pub fn register(&self, event_type: &str, decoder: Option<EventDecoder>) {
        let Some(decoder) = decoder else { return };
        if event_type.is_empty() {
            return;
        }
        self.decoders
            .write()
            .expect("event registry poisoned")
            .insert(event_type.to_owned(), decoder);
    }

    pub fn len(&self) -> usize {
        self.decoders.read().expect("event registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes a stored row into a typed event.
    ///
    /// Returns `UnknownEventType` when nothing is registered for the row's
    /// event type and `Decode` when the registered decoder fails.
    pub fn decode(&self, event: &StoredEvent) -> Result<Box<dyn DomainEvent>> {
        let decoder = self
            .decoders
            .read()
            .expect("event registry poisoned")
            .get(&event.event_type)
            .cloned()
            .ok_or_else(|| {
                EventStoreError::unknown_event_type("EVS-Bh4wt", &event.event_type)
            })?;

        decoder(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventHeader;
    use chrono::Utc;
    use std::any::Any;

    #[derive(Debug)]
    struct TestEvent {
        header: EventHeader,
    }

    impl DomainEvent for TestEvent {
        fn header(&self) -> &EventHeader {
            &self.header
        }

        fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
            Ok(None)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn test_decoder(stored: &StoredEvent) -> Result<Box<dyn DomainEvent>> {
        Ok(Box::new(TestEvent {
            header: EventHeader::from_stored(stored),
        }))
    }

    fn stored(event_type: &str) -> StoredEvent {
        StoredEvent {
            aggregate_id: "1".to_owned(),
            aggregate_type: "test.aggregate".to_owned(),
            aggregate_version: "v1".to_owned(),
            event_type: event_type.to_owned(),
            sequence: 1,
            previous_sequence: 0,
            event_date: Utc::now(),
            resource_owner: "ro".to_owned(),
            editor_service: "svc".to_owned(),
            editor_user: "usr".to_owned(),
            data: None,
        }
    }

    #[test]
    fn empty_event_type_is_ignored() {
        let registry = EventRegistry::new();
        registry.register("", Some(decoder(test_decoder)));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn missing_decoder_is_ignored() {
        let registry = EventRegistry::new();
        registry.register("event.type", None);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn new_decoder_is_registered() {
        let registry = EventRegistry::new();
        registry.register("event.type", Some(decoder(test_decoder)));
        assert_eq!(registry.len(), 1);

        let event = registry.decode(&stored("event.type")).unwrap();
        assert_eq!(event.header().event_type, "event.type");
    }

    #[test]
    fn reregistering_replaces_the_decoder() {
        let registry = EventRegistry::new();
        registry.register(
            "event.type",
            Some(decoder(|_| {
                Err(EventStoreError::internal("EVS-1qPvn", "unimplemented"))
            })),
        );
        registry.register("event.type", Some(decoder(test_decoder)));
        assert_eq!(registry.len(), 1);

        assert!(registry.decode(&stored("event.type")).is_ok());
    }

    #[test]
    fn unregistered_type_is_a_hard_error() {
        let registry = EventRegistry::new();
        let err = registry.decode(&stored("no.mapper.found")).unwrap_err();
        assert!(matches!(err, EventStoreError::UnknownEventType { .. }));
    }

    #[test]
    fn decoder_failure_surfaces_as_decode_error() {
        let registry = EventRegistry::new();
        registry.register(
            "event.type",
            Some(decoder(|stored| {
                let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
                Err(EventStoreError::decode("EVS-8FbQk", &stored.event_type, err))
            })),
        );

        let err = registry.decode(&stored("event.type")).unwrap_err();
        assert!(matches!(err, EventStoreError::Decode { .. }));
    }

    #[test]
    fn header_is_overwritten_from_the_stored_row() {
        let registry = EventRegistry::new();
        registry.register("event.type", Some(decoder(test_decoder)));

        let mut row = stored("event.type");
        row.sequence = 42;
        let event = registry.decode(&row).unwrap();
        assert_eq!(event.header().sequence, 42);
        assert_eq!(event.header().editor_user, "usr");
    }
}
