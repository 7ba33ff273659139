//! The long-lived projection contract.

use eventstore::{DomainEvent, SearchQueryBuilder};

use crate::Result;

/// A long-lived reducer maintaining externally persisted state.
///
/// Unlike a one-shot [`Fold`](eventstore::Fold), a projection outlives
/// any single catch-up pass: its progress is tracked by a watermark row
/// in `projections.current_states` and the runner only feeds it events
/// above that watermark. `reduce` must be deterministic so that
/// re-folding any prefix of the log reproduces the same state.
pub trait Project: Send {
    /// Stable name identifying this projection's watermark row.
    fn name(&self) -> &'static str;

    /// Query selecting the events this projection consumes. The runner
    /// narrows it past the current watermark before filtering.
    fn query(&self) -> SearchQueryBuilder;

    /// Applies one batch of mapped events, in sequence order.
    fn reduce(&mut self, events: Vec<Box<dyn DomainEvent>>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProjectionState;
    use eventstore::{Editor, Eventstore, InMemoryRepository};
    use iam::member::{MemberAddedEvent, MemberRemovedEvent};
    use iam::{AGGREGATE_TYPE, AGGREGATE_VERSION};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Counts active members across the whole instance.
    #[derive(Default)]
    struct MemberCountProjection {
        active: i64,
    }

    impl Project for MemberCountProjection {
        fn name(&self) -> &'static str {
            "iam.member_count"
        }

        fn query(&self) -> SearchQueryBuilder {
            SearchQueryBuilder::new([AGGREGATE_TYPE]).event_types([
                iam::member::MEMBER_ADDED,
                iam::member::MEMBER_REMOVED,
            ])
        }

        fn reduce(&mut self, events: Vec<Box<dyn DomainEvent>>) -> Result<()> {
            for event in &events {
                let any = event.as_any();
                if any.downcast_ref::<MemberAddedEvent>().is_some() {
                    self.active += 1;
                } else if any.downcast_ref::<MemberRemovedEvent>().is_some() {
                    self.active -= 1;
                }
            }
            Ok(())
        }
    }

    async fn seeded_eventstore() -> Eventstore {
        let es = Eventstore::new(Arc::new(InMemoryRepository::new()));
        iam::register_event_mappers(&es);
        let cancel = CancellationToken::new();
        let editor = Editor::new("test", "test");

        let aggregate = eventstore::Aggregate::new("iam-1", AGGREGATE_TYPE, "iam-1", AGGREGATE_VERSION, 0)
            .push_event(MemberAddedEvent::new(&editor, "u1", vec!["A".to_owned()]))
            .push_event(MemberAddedEvent::new(&editor, "u2", vec!["B".to_owned()]))
            .push_event(MemberRemovedEvent::new(&editor, "u1"));
        es.push_aggregates(&cancel, vec![aggregate]).await.unwrap();
        es
    }

    #[tokio::test]
    async fn projection_folds_its_filtered_stream() {
        let es = seeded_eventstore().await;
        let cancel = CancellationToken::new();
        let mut projection = MemberCountProjection::default();
        let mut state = ProjectionState::new("default", projection.name());

        let events = es
            .filter_events(&cancel, projection.query().sequence_greater(state.sequence))
            .await
            .unwrap();
        state.advance(&events);
        projection.reduce(events).unwrap();

        assert_eq!(projection.active, 1);
        assert_eq!(state.sequence, 3);
        assert_eq!(state.position, 3.0);
        assert_eq!(state.aggregate_id.as_deref(), Some("iam-1"));

        // A second pass past the watermark sees nothing new.
        let events = es
            .filter_events(&cancel, projection.query().sequence_greater(state.sequence))
            .await
            .unwrap();
        assert!(events.is_empty());
    }
}
