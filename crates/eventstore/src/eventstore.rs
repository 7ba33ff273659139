//! The eventstore facade: command-side pushes and query-side folds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::Result;
use crate::aggregate::{Aggregate, Fold, QueryFold};
use crate::error::EventStoreError;
use crate::event::{DomainEvent, event_data};
use crate::query::{Columns, SearchQueryBuilder};
use crate::registry::{EventDecoder, EventRegistry};
use crate::repository::{EventRepository, PushEvent, StoredEvent};

/// Facade over the persistence port, the decoder registry and the fold
/// contracts.
///
/// Re-entrant: commands and queries may run concurrently on the same
/// instance. Write- and read-models are not shared; callers must not fold
/// the same model from two tasks.
pub struct Eventstore {
    repo: Arc<dyn EventRepository>,
    registry: EventRegistry,
}

impl Eventstore {
    /// The single configuration option of the core: the persistence port
    /// instance.
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        Self {
            repo,
            registry: EventRegistry::new(),
        }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Registers a decoder for `event_type`; see
    /// [`EventRegistry::register`].
    pub fn register_decoder(&self, event_type: &str, decoder: Option<EventDecoder>) -> &Self {
        self.registry.register(event_type, decoder);
        self
    }

    #[instrument(skip_all)]
    pub async fn health(&self, cancel: &CancellationToken) -> Result<()> {
        self.repo.health(cancel).await
    }

    /// Appends every pending event of `aggregates` as one atomic batch and
    /// returns the committed events, mapped, for re-folding.
    ///
    /// Aggregates without pending events are skipped; a batch that ends up
    /// empty is a true no-op and never reaches the store.
    #[instrument(skip_all, fields(aggregates = aggregates.len()))]
    pub async fn push_aggregates(
        &self,
        cancel: &CancellationToken,
        aggregates: Vec<Aggregate>,
    ) -> Result<Vec<Box<dyn DomainEvent>>> {
        if cancel.is_cancelled() {
            return Err(EventStoreError::cancelled("EVS-o4GbA"));
        }

        let batch = aggregates_to_push_events(aggregates)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let stored = self.repo.push(cancel, batch).await?;
        self.map_events(&stored)
    }

    /// Returns the mapped events matching the query.
    #[instrument(skip_all)]
    pub async fn filter_events(
        &self,
        cancel: &CancellationToken,
        query: SearchQueryBuilder,
    ) -> Result<Vec<Box<dyn DomainEvent>>> {
        let query = query.columns(Columns::Event).build()?;
        if cancel.is_cancelled() {
            return Err(EventStoreError::cancelled("EVS-J7pTn"));
        }

        let stored = self.repo.filter(cancel, &query).await?;
        self.map_events(&stored)
    }

    /// Returns the highest sequence among matching events, or `0`. Uses
    /// the canonical max-sequence probe shape (descending, limit 1).
    #[instrument(skip_all)]
    pub async fn latest_sequence(
        &self,
        cancel: &CancellationToken,
        query: SearchQueryBuilder,
    ) -> Result<u64> {
        let query = query
            .columns(Columns::MaxSequence)
            .order_desc()
            .limit(1)
            .build()?;
        if cancel.is_cancelled() {
            return Err(EventStoreError::cancelled("EVS-d2Fyh"));
        }

        self.repo.latest_sequence(cancel, &query).await
    }

    /// Filters with the caller's query and folds the mapped events into
    /// `model`. On any error the model is left partially updated and must
    /// be discarded by the caller.
    #[instrument(skip_all)]
    pub async fn filter_to_reducer(
        &self,
        cancel: &CancellationToken,
        query: SearchQueryBuilder,
        model: &mut dyn Fold,
    ) -> Result<()> {
        let events = self.filter_events(cancel, query).await?;
        model.append_events(events)?;
        model.reduce()
    }

    /// Folds a model that supplies its own query; the usual way of
    /// reconstructing one aggregate's state.
    #[instrument(skip_all)]
    pub async fn filter_to_query_reducer(
        &self,
        cancel: &CancellationToken,
        model: &mut dyn QueryFold,
    ) -> Result<()> {
        let events = self.filter_events(cancel, model.query()).await?;
        model.append_events(events)?;
        model.reduce()
    }

    fn map_events(&self, stored: &[StoredEvent]) -> Result<Vec<Box<dyn DomainEvent>>> {
        stored
            .iter()
            .map(|event| {
                if event.aggregate_id.is_empty() {
                    return Err(EventStoreError::internal(
                        "EVS-Sjd4r",
                        format!("store returned {:?} without aggregate id", event.event_type),
                    ));
                }
                self.registry.decode(event)
            })
            .collect()
    }
}

/// Flattens aggregates into the wire batch: validates payloads, links the
/// in-batch chain, and places one previous-sequence assertion on the
/// first event of each aggregate.
fn aggregates_to_push_events(aggregates: Vec<Aggregate>) -> Result<Vec<PushEvent>> {
    let mut owners: HashMap<(String, String), String> = HashMap::new();
    for aggregate in &aggregates {
        let key = (
            aggregate.aggregate_type().to_owned(),
            aggregate.id().to_owned(),
        );
        match owners.entry(key) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(aggregate.resource_owner().to_owned());
            }
            std::collections::hash_map::Entry::Occupied(entry) => {
                if entry.get() != aggregate.resource_owner() {
                    return Err(EventStoreError::internal(
                        "EVS-eZyl3",
                        format!(
                            "aggregate {:?} pushed with ambiguous resource owners",
                            aggregate.id()
                        ),
                    ));
                }
            }
        }
    }

    let mut batch = Vec::new();
    for aggregate in aggregates {
        let aggregate_id = aggregate.id().to_owned();
        let aggregate_type = aggregate.aggregate_type().to_owned();
        let aggregate_version = aggregate.version().to_owned();
        let resource_owner = aggregate.resource_owner().to_owned();
        let previous_sequence = aggregate.previous_sequence();

        let mut first = true;
        for event in aggregate.into_events() {
            let data = event_data(event.as_ref())?;
            let header = event.header();
            batch.push(PushEvent {
                aggregate_id: aggregate_id.clone(),
                aggregate_type: aggregate_type.clone(),
                aggregate_version: aggregate_version.clone(),
                event_type: header.event_type.clone(),
                previous_sequence,
                check_previous: first,
                resource_owner: resource_owner.clone(),
                editor_service: header.editor_service.clone(),
                editor_user: header.editor_user.clone(),
                data,
                previous_event: batch.len().checked_sub(1),
            });
            first = false;
        }
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ReadModel;
    use crate::event::{Editor, EventHeader};
    use crate::query::SearchQuery;
    use crate::registry::decoder;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};
    use std::any::Any;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct TestEvent {
        header: EventHeader,
        data: Option<Value>,
    }

    impl TestEvent {
        fn new(data: Option<Value>) -> Self {
            Self {
                header: EventHeader::for_push("test.event", &Editor::new("svc", "usr")),
                data,
            }
        }
    }

    impl DomainEvent for TestEvent {
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

    fn test_event_decoder(stored: &StoredEvent) -> Result<Box<dyn DomainEvent>> {
        Ok(Box::new(TestEvent {
            header: EventHeader::from_stored(stored),
            data: stored.data.clone(),
        }))
    }

    /// Port stub recording pushes and replaying canned filter results.
    #[derive(Default)]
    struct TestRepo {
        events: Vec<StoredEvent>,
        sequence: u64,
        fail: bool,
        pushed: Mutex<Vec<PushEvent>>,
    }

    impl TestRepo {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn with_events(events: Vec<StoredEvent>) -> Self {
            Self {
                events,
                ..Self::default()
            }
        }
    }

    fn stored(aggregate_id: &str, event_type: &str, sequence: u64) -> StoredEvent {
        StoredEvent {
            aggregate_id: aggregate_id.to_owned(),
            aggregate_type: "test.aggregate".to_owned(),
            aggregate_version: "v1".to_owned(),
            event_type: event_type.to_owned(),
            sequence,
            previous_sequence: sequence.saturating_sub(1),
            event_date: Utc::now(),
            resource_owner: "ro".to_owned(),
            editor_service: "svc".to_owned(),
            editor_user: "usr".to_owned(),
            data: None,
        }
    }

    #[async_trait]
    impl EventRepository for TestRepo {
        async fn health(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn push(
            &self,
            _cancel: &CancellationToken,
            events: Vec<PushEvent>,
        ) -> Result<Vec<StoredEvent>> {
            if self.fail {
                return Err(EventStoreError::internal("EVS-qaa4S", "test err"));
            }

            let committed = events
                .iter()
                .enumerate()
                .map(|(i, event)| StoredEvent {
                    aggregate_id: event.aggregate_id.clone(),
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_version: event.aggregate_version.clone(),
                    event_type: event.event_type.clone(),
                    sequence: i as u64 + 1,
                    previous_sequence: event.previous_sequence,
                    event_date: Utc::now(),
                    resource_owner: event.resource_owner.clone(),
                    editor_service: event.editor_service.clone(),
                    editor_user: event.editor_user.clone(),
                    data: event.data.clone(),
                })
                .collect();
            self.pushed.lock().unwrap().extend(events);
            Ok(committed)
        }

        async fn filter(
            &self,
            _cancel: &CancellationToken,
            _query: &SearchQuery,
        ) -> Result<Vec<StoredEvent>> {
            if self.fail {
                return Err(EventStoreError::internal("EVS-RfkBa", "test err"));
            }
            Ok(self.events.clone())
        }

        async fn latest_sequence(
            &self,
            _cancel: &CancellationToken,
            _query: &SearchQuery,
        ) -> Result<u64> {
            if self.fail {
                return Err(EventStoreError::internal("EVS-RfkBa", "test err"));
            }
            Ok(self.sequence)
        }
    }

    fn eventstore(repo: TestRepo) -> Eventstore {
        let (_, es) = eventstore_with_repo(repo);
        es
    }

    fn eventstore_with_repo(repo: TestRepo) -> (Arc<TestRepo>, Eventstore) {
        let repo = Arc::new(repo);
        let es = Eventstore::new(repo.clone());
        es.register_decoder("test.event", Some(decoder(test_event_decoder)));
        (repo, es)
    }

    fn aggregate(id: &str, previous_sequence: u64, events: Vec<TestEvent>) -> Aggregate {
        let mut aggregate = Aggregate::new(id, "test.aggregate", "ro", "v1", previous_sequence);
        for event in events {
            aggregate = aggregate.push_event(event);
        }
        aggregate
    }

    #[test]
    fn one_aggregate_one_event() {
        let batch =
            aggregates_to_push_events(vec![aggregate("1", 0, vec![TestEvent::new(None)])]).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].aggregate_id, "1");
        assert_eq!(batch[0].aggregate_type, "test.aggregate");
        assert_eq!(batch[0].aggregate_version, "v1");
        assert_eq!(batch[0].event_type, "test.event");
        assert_eq!(batch[0].editor_service, "svc");
        assert_eq!(batch[0].editor_user, "usr");
        assert_eq!(batch[0].resource_owner, "ro");
        assert!(batch[0].check_previous);
        assert_eq!(batch[0].previous_event, None);
        assert_eq!(batch[0].data, None);
    }

    #[test]
    fn batch_chain_links_events_across_aggregates() {
        let batch = aggregates_to_push_events(vec![
            aggregate("1", 2, vec![TestEvent::new(None), TestEvent::new(None)]),
            aggregate("2", 0, vec![TestEvent::new(None)]),
        ])
        .unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].previous_event, None);
        assert_eq!(batch[1].previous_event, Some(0));
        assert_eq!(batch[2].previous_event, Some(1));

        // One assertion per aggregate, on its first event.
        assert!(batch[0].check_previous);
        assert!(!batch[1].check_previous);
        assert!(batch[2].check_previous);
        assert_eq!(batch[0].previous_sequence, 2);
        assert_eq!(batch[2].previous_sequence, 0);
    }

    #[test]
    fn invalid_payload_aborts_the_conversion() {
        let err = aggregates_to_push_events(vec![aggregate(
            "1",
            0,
            vec![TestEvent::new(Some(json!("scalar")))],
        )])
        .unwrap_err();
        assert!(matches!(err, EventStoreError::Internal { .. }));
    }

    #[test]
    fn ambiguous_resource_owners_are_rejected() {
        let first = aggregate("1", 0, vec![TestEvent::new(None)]);
        let mut second = Aggregate::new("1", "test.aggregate", "other-ro", "v1", 0);
        second = second.push_event(TestEvent::new(None));

        let err = aggregates_to_push_events(vec![first, second]).unwrap_err();
        assert!(matches!(err, EventStoreError::Internal { .. }));
    }

    #[tokio::test]
    async fn push_maps_the_committed_events() {
        let (repo, es) = eventstore_with_repo(TestRepo::default());
        let cancel = CancellationToken::new();

        let mapped = es
            .push_aggregates(
                &cancel,
                vec![aggregate(
                    "1",
                    0,
                    vec![
                        TestEvent::new(Some(json!({"piff": "paff"}))),
                        TestEvent::new(None),
                    ],
                )],
            )
            .await
            .unwrap();

        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].header().sequence, 1);
        assert_eq!(mapped[1].header().sequence, 2);

        let pushed = repo.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0].data, Some(json!({"piff": "paff"})));
        assert_eq!(pushed[1].previous_event, Some(0));
        assert!(!pushed[1].check_previous);
    }

    #[tokio::test]
    async fn push_without_events_is_a_no_op() {
        // The failing repo proves the store is never contacted.
        let es = eventstore(TestRepo::failing());
        let cancel = CancellationToken::new();

        let mapped = es
            .push_aggregates(&cancel, vec![aggregate("1", 0, vec![])])
            .await
            .unwrap();
        assert!(mapped.is_empty());
    }

    #[tokio::test]
    async fn push_bubbles_repo_errors() {
        let es = eventstore(TestRepo::failing());
        let cancel = CancellationToken::new();

        let err = es
            .push_aggregates(&cancel, vec![aggregate("1", 0, vec![TestEvent::new(None)])])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Internal { .. }));
    }

    #[tokio::test]
    async fn cancelled_push_never_reaches_the_store() {
        let es = eventstore(TestRepo::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = es
            .push_aggregates(&cancel, vec![aggregate("1", 0, vec![TestEvent::new(None)])])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn filter_rejects_invalid_queries_before_io() {
        let es = eventstore(TestRepo::failing());
        let cancel = CancellationToken::new();

        // The failing repo would error; the invalid query must win.
        let err = es
            .filter_events(&cancel, SearchQueryBuilder::new(Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn filter_maps_found_events() {
        let es = eventstore(TestRepo::with_events(vec![stored("1", "test.event", 1)]));
        let cancel = CancellationToken::new();

        let events = es
            .filter_events(&cancel, SearchQueryBuilder::new(["test.aggregate"]))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].header().aggregate_id, "1");
    }

    #[tokio::test]
    async fn filter_without_mapper_is_a_hard_error() {
        let es = Eventstore::new(Arc::new(TestRepo::with_events(vec![stored(
            "1",
            "no.mapper.found",
            1,
        )])));
        let cancel = CancellationToken::new();

        let err = es
            .filter_events(&cancel, SearchQueryBuilder::new(["test.aggregate"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::UnknownEventType { .. }));
    }

    #[tokio::test]
    async fn stored_event_without_aggregate_id_is_an_invariant_breach() {
        let es = eventstore(TestRepo::with_events(vec![stored("", "test.event", 1)]));
        let cancel = CancellationToken::new();

        let err = es
            .filter_events(&cancel, SearchQueryBuilder::new(["test.aggregate"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Internal { .. }));
    }

    #[tokio::test]
    async fn latest_sequence_uses_the_canonical_probe() {
        let es = eventstore(TestRepo {
            sequence: 50,
            ..TestRepo::default()
        });
        let cancel = CancellationToken::new();

        let sequence = es
            .latest_sequence(&cancel, SearchQueryBuilder::new(["test.aggregate"]))
            .await
            .unwrap();
        assert_eq!(sequence, 50);

        let err = es
            .latest_sequence(&cancel, SearchQueryBuilder::new(Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidQuery { .. }));
    }

    struct CountingModel {
        model: ReadModel,
        seen: usize,
        fail_append: bool,
    }

    impl CountingModel {
        fn new() -> Self {
            Self {
                model: ReadModel::new("1"),
                seen: 0,
                fail_append: false,
            }
        }
    }

    impl Fold for CountingModel {
        fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) -> Result<()> {
            if self.fail_append {
                return Err(EventStoreError::internal("EVS-W06TG", "test err"));
            }
            self.seen += events.len();
            self.model.append_events(events);
            Ok(())
        }

        fn reduce(&mut self) -> Result<()> {
            self.model.reduce()
        }
    }

    impl QueryFold for CountingModel {
        fn query(&self) -> SearchQueryBuilder {
            SearchQueryBuilder::new(["test.aggregate"])
                .aggregate_ids([self.model.aggregate_id.clone()])
                .sequence_greater(self.model.processed_sequence)
        }
    }

    #[tokio::test]
    async fn filter_to_reducer_folds_found_events() {
        let es = eventstore(TestRepo::with_events(vec![stored("1", "test.event", 1)]));
        let cancel = CancellationToken::new();
        let mut model = CountingModel::new();

        es.filter_to_reducer(
            &cancel,
            SearchQueryBuilder::new(["test.aggregate"]),
            &mut model,
        )
        .await
        .unwrap();

        assert_eq!(model.seen, 1);
        assert_eq!(model.model.processed_sequence, 1);
    }

    #[tokio::test]
    async fn filter_to_reducer_bubbles_append_errors() {
        let es = eventstore(TestRepo::with_events(vec![stored("1", "test.event", 1)]));
        let cancel = CancellationToken::new();
        let mut model = CountingModel::new();
        model.fail_append = true;

        let err = es
            .filter_to_reducer(
                &cancel,
                SearchQueryBuilder::new(["test.aggregate"]),
                &mut model,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Internal { .. }));
    }

    #[tokio::test]
    async fn filter_to_query_reducer_uses_the_models_query() {
        let es = eventstore(TestRepo::with_events(vec![
            stored("1", "test.event", 1),
            stored("1", "test.event", 2),
        ]));
        let cancel = CancellationToken::new();
        let mut model = CountingModel::new();

        es.filter_to_query_reducer(&cancel, &mut model).await.unwrap();
        assert_eq!(model.model.processed_sequence, 2);
    }
}
