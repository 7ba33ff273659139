//! In-memory event log for tests and examples.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::EventStoreError;
use crate::query::{Columns, Ordering, SearchQuery};
use crate::repository::{EventRepository, PushEvent, StoredEvent};

#[derive(Default)]
struct Log {
    events: Vec<StoredEvent>,
    sequence: u64,
}

impl Log {
    fn latest_sequence_of(&self, aggregate_type: &str, aggregate_id: &str) -> u64 {
        self.events
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && e.aggregate_id == aggregate_id)
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0)
    }

    fn resource_owner_of(&self, aggregate_type: &str, aggregate_id: &str) -> Option<&str> {
        self.events
            .iter()
            .find(|e| e.aggregate_type == aggregate_type && e.aggregate_id == aggregate_id)
            .map(|e| e.resource_owner.as_str())
    }
}

/// In-memory [`EventRepository`] implementation.
///
/// Sequences are assigned from one globally monotonic counter, so they are
/// strictly increasing per aggregate and across the whole log. The write
/// lock makes each push atomic; the observable invariants match the
/// PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    log: Arc<RwLock<Log>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of committed events, across all aggregates.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }
}

#[async_trait]
impl EventRepository for InMemoryRepository {
    async fn health(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EventStoreError::cancelled("EVS-jM2fw"));
        }
        Ok(())
    }

    async fn push(
        &self,
        cancel: &CancellationToken,
        events: Vec<PushEvent>,
    ) -> Result<Vec<StoredEvent>> {
        if cancel.is_cancelled() {
            return Err(EventStoreError::cancelled("EVS-x1Rql"));
        }

        let mut log = self.log.write().await;

        // Per aggregate the lowest asserted previous_sequence is effective.
        {
            let mut assertions: HashMap<(&str, &str), u64> = HashMap::new();
            for event in events.iter().filter(|e| e.check_previous) {
                assertions
                    .entry((&event.aggregate_type, &event.aggregate_id))
                    .and_modify(|asserted| *asserted = (*asserted).min(event.previous_sequence))
                    .or_insert(event.previous_sequence);
            }

            for (&(aggregate_type, aggregate_id), &asserted) in &assertions {
                let latest = log.latest_sequence_of(aggregate_type, aggregate_id);
                if latest != asserted {
                    return Err(EventStoreError::concurrency(
                        "EVS-Ks3fb",
                        aggregate_id,
                        asserted,
                        latest,
                    ));
                }
            }
        }

        for event in &events {
            if let Some(owner) = log.resource_owner_of(&event.aggregate_type, &event.aggregate_id)
                && owner != event.resource_owner
            {
                return Err(EventStoreError::internal(
                    "EVS-GpWu9",
                    format!(
                        "aggregate {:?} pushed with resource owner {:?}, log has {owner:?}",
                        event.aggregate_id, event.resource_owner
                    ),
                ));
            }
        }

        // All assertions hold: commit the whole batch in supplied order.
        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            log.sequence += 1;
            committed.push(StoredEvent {
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                aggregate_version: event.aggregate_version,
                event_type: event.event_type,
                sequence: log.sequence,
                previous_sequence: event.previous_sequence,
                event_date: Utc::now(),
                resource_owner: event.resource_owner,
                editor_service: event.editor_service,
                editor_user: event.editor_user,
                data: event.data,
            });
        }
        log.events.extend(committed.iter().cloned());

        Ok(committed)
    }

    async fn filter(
        &self,
        cancel: &CancellationToken,
        query: &SearchQuery,
    ) -> Result<Vec<StoredEvent>> {
        if cancel.is_cancelled() {
            return Err(EventStoreError::cancelled("EVS-c7Lop"));
        }
        if query.columns == Columns::MaxSequence {
            return Err(EventStoreError::unsupported(
                "EVS-v5Dzh",
                "max-sequence queries go through latest_sequence",
            ));
        }

        let log = self.log.read().await;
        let mut events: Vec<_> = log
            .events
            .iter()
            .filter(|e| matches(e, query))
            .cloned()
            .collect();

        events.sort_by_key(|e| e.sequence);
        if query.ordering == Ordering::Descending {
            events.reverse();
        }
        if let Some(limit) = query.limit {
            events.truncate(limit as usize);
        }

        Ok(events)
    }

    async fn latest_sequence(
        &self,
        cancel: &CancellationToken,
        query: &SearchQuery,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EventStoreError::cancelled("EVS-n8Hkj"));
        }

        let log = self.log.read().await;
        Ok(log
            .events
            .iter()
            .filter(|e| matches(e, query))
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0))
    }
}

fn matches(event: &StoredEvent, query: &SearchQuery) -> bool {
    if !query.aggregate_types.contains(&event.aggregate_type) {
        return false;
    }
    if !query.aggregate_ids.is_empty() && !query.aggregate_ids.contains(&event.aggregate_id) {
        return false;
    }
    if !query.event_types.is_empty() && !query.event_types.contains(&event.event_type) {
        return false;
    }
    if !query.resource_owners.is_empty()
        && !query.resource_owners.contains(&event.resource_owner)
    {
        return false;
    }
    if query.sequence_greater > 0 && event.sequence <= query.sequence_greater {
        return false;
    }
    if let Some(at_most) = query.sequence_at_most
        && event.sequence > at_most
    {
        return false;
    }
    if let Some(predicates) = &query.event_data {
        return predicates
            .iter()
            .all(|(key, expected)| data_matches(event.data.as_ref(), key, expected));
    }
    true
}

/// Equality on scalar values; dotted keys descend into nested objects and
/// require existence along the whole path.
fn data_matches(data: Option<&Value>, key: &str, expected: &Value) -> bool {
    let Some(mut current) = data else {
        return false;
    };
    for part in key.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return false,
        }
    }
    current == expected
}
