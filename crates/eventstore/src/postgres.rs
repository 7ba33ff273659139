//! PostgreSQL-backed event log.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::Result;
use crate::error::EventStoreError;
use crate::query::{Columns, Ordering, SearchQuery};
use crate::repository::{EventRepository, PushEvent, StoredEvent};

/// PostgreSQL [`EventRepository`] implementation.
///
/// One `eventstore.events` table keyed by a `BIGSERIAL` sequence; data
/// predicates compile to JSONB containment. Pushes run in a serializable
/// transaction, so the previous-sequence check and the inserts commit as
/// one unit.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<StoredEvent> {
        let read = |err| EventStoreError::storage("EVS-kW2pd", err);
        Ok(StoredEvent {
            aggregate_id: row.try_get("aggregate_id").map_err(read)?,
            aggregate_type: row.try_get("aggregate_type").map_err(read)?,
            aggregate_version: row.try_get("aggregate_version").map_err(read)?,
            event_type: row.try_get("event_type").map_err(read)?,
            sequence: row.try_get::<i64, _>("sequence").map_err(read)? as u64,
            previous_sequence: row.try_get::<i64, _>("previous_sequence").map_err(read)? as u64,
            event_date: row
                .try_get::<DateTime<Utc>, _>("event_date")
                .map_err(read)?,
            resource_owner: row.try_get("resource_owner").map_err(read)?,
            editor_service: row.try_get("editor_service").map_err(read)?,
            editor_user: row.try_get("editor_user").map_err(read)?,
            data: row.try_get("data").map_err(read)?,
        })
    }
}

#[async_trait]
impl EventRepository for PostgresRepository {
    #[instrument(skip_all)]
    async fn health(&self, cancel: &CancellationToken) -> Result<()> {
        let probe = async {
            sqlx::query("SELECT 1")
                .fetch_one(&self.pool)
                .await
                .map_err(|err| EventStoreError::storage("EVS-t6Nvc", err))?;
            Ok(())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EventStoreError::cancelled("EVS-r3Wma")),
            result = probe => result,
        }
    }

    #[instrument(skip_all, fields(events = events.len()))]
    async fn push(
        &self,
        cancel: &CancellationToken,
        events: Vec<PushEvent>,
    ) -> Result<Vec<StoredEvent>> {
        // Dropping the in-flight transaction on cancellation rolls it
        // back, so the batch is all-or-nothing either way.
        let commit = async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| EventStoreError::storage("EVS-b8Qlf", err))?;

            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(|err| EventStoreError::storage("EVS-i4Kcz", err))?;

            // Per aggregate the lowest asserted previous_sequence is
            // effective.
            let mut assertions: HashMap<(&str, &str), u64> = HashMap::new();
            for event in events.iter().filter(|e| e.check_previous) {
                assertions
                    .entry((&event.aggregate_type, &event.aggregate_id))
                    .and_modify(|asserted| *asserted = (*asserted).min(event.previous_sequence))
                    .or_insert(event.previous_sequence);
            }

            for (&(aggregate_type, aggregate_id), &asserted) in &assertions {
                let latest: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(sequence), 0) FROM eventstore.events \
                     WHERE aggregate_type = $1 AND aggregate_id = $2",
                )
                .bind(aggregate_type)
                .bind(aggregate_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(push_error)?;

                if latest as u64 != asserted {
                    return Err(EventStoreError::concurrency(
                        "EVS-Mh8Sy",
                        aggregate_id,
                        asserted,
                        latest as u64,
                    ));
                }
            }

            let mut committed = Vec::with_capacity(events.len());
            for event in &events {
                let row = sqlx::query(
                    "INSERT INTO eventstore.events \
                     (aggregate_type, aggregate_id, aggregate_version, event_type, \
                      previous_sequence, resource_owner, editor_service, editor_user, data) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     RETURNING sequence, event_date",
                )
                .bind(&event.aggregate_type)
                .bind(&event.aggregate_id)
                .bind(&event.aggregate_version)
                .bind(&event.event_type)
                .bind(event.previous_sequence as i64)
                .bind(&event.resource_owner)
                .bind(&event.editor_service)
                .bind(&event.editor_user)
                .bind(&event.data)
                .fetch_one(&mut *tx)
                .await
                .map_err(push_error)?;

                let sequence: i64 = row
                    .try_get("sequence")
                    .map_err(|err| EventStoreError::storage("EVS-y2Tgn", err))?;
                let event_date: DateTime<Utc> = row
                    .try_get("event_date")
                    .map_err(|err| EventStoreError::storage("EVS-y2Tgn", err))?;

                committed.push(StoredEvent {
                    aggregate_id: event.aggregate_id.clone(),
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_version: event.aggregate_version.clone(),
                    event_type: event.event_type.clone(),
                    sequence: sequence as u64,
                    previous_sequence: event.previous_sequence,
                    event_date,
                    resource_owner: event.resource_owner.clone(),
                    editor_service: event.editor_service.clone(),
                    editor_user: event.editor_user.clone(),
                    data: event.data.clone(),
                });
            }

            tx.commit()
                .await
                .map_err(|err| EventStoreError::storage("EVS-f9Xrd", err))?;
            Ok(committed)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EventStoreError::cancelled("EVS-w5Jub")),
            result = commit => result,
        }
    }

    #[instrument(skip_all)]
    async fn filter(
        &self,
        cancel: &CancellationToken,
        query: &SearchQuery,
    ) -> Result<Vec<StoredEvent>> {
        if query.columns == Columns::MaxSequence {
            return Err(EventStoreError::unsupported(
                "EVS-e1Zpo",
                "max-sequence queries go through latest_sequence",
            ));
        }

        let mut sql = String::from(
            "SELECT aggregate_type, aggregate_id, aggregate_version, event_type, \
             sequence, previous_sequence, event_date, resource_owner, \
             editor_service, editor_user, data \
             FROM eventstore.events",
        );
        let params = where_clause(&mut sql, query);

        sql.push_str(match query.ordering {
            Ordering::Ascending => " ORDER BY sequence ASC",
            Ordering::Descending => " ORDER BY sequence DESC",
        });
        if query.limit.is_some() {
            sql.push_str(&format!(" LIMIT ${}", params + 1));
        }

        let mut sqlx_query = sqlx::query(&sql).bind(&query.aggregate_types);
        if !query.aggregate_ids.is_empty() {
            sqlx_query = sqlx_query.bind(&query.aggregate_ids);
        }
        if !query.event_types.is_empty() {
            sqlx_query = sqlx_query.bind(&query.event_types);
        }
        if !query.resource_owners.is_empty() {
            sqlx_query = sqlx_query.bind(&query.resource_owners);
        }
        if query.sequence_greater > 0 {
            sqlx_query = sqlx_query.bind(query.sequence_greater as i64);
        }
        if let Some(at_most) = query.sequence_at_most {
            sqlx_query = sqlx_query.bind(at_most as i64);
        }
        if let Some(predicates) = &query.event_data {
            for (key, value) in predicates {
                sqlx_query = sqlx_query.bind(containment(key, value));
            }
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let fetch = async {
            let rows = sqlx_query
                .fetch_all(&self.pool)
                .await
                .map_err(|err| EventStoreError::storage("EVS-a7Vds", err))?;
            rows.into_iter().map(Self::row_to_event).collect()
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EventStoreError::cancelled("EVS-g4Imw")),
            result = fetch => result,
        }
    }

    #[instrument(skip_all)]
    async fn latest_sequence(
        &self,
        cancel: &CancellationToken,
        query: &SearchQuery,
    ) -> Result<u64> {
        let mut sql = String::from("SELECT COALESCE(MAX(sequence), 0) FROM eventstore.events");
        where_clause(&mut sql, query);

        let mut sqlx_query = sqlx::query_scalar::<_, i64>(&sql).bind(&query.aggregate_types);
        if !query.aggregate_ids.is_empty() {
            sqlx_query = sqlx_query.bind(&query.aggregate_ids);
        }
        if !query.event_types.is_empty() {
            sqlx_query = sqlx_query.bind(&query.event_types);
        }
        if !query.resource_owners.is_empty() {
            sqlx_query = sqlx_query.bind(&query.resource_owners);
        }
        if query.sequence_greater > 0 {
            sqlx_query = sqlx_query.bind(query.sequence_greater as i64);
        }
        if let Some(at_most) = query.sequence_at_most {
            sqlx_query = sqlx_query.bind(at_most as i64);
        }
        if let Some(predicates) = &query.event_data {
            for (key, value) in predicates {
                sqlx_query = sqlx_query.bind(containment(key, value));
            }
        }

        let fetch = async {
            let latest = sqlx_query
                .fetch_one(&self.pool)
                .await
                .map_err(|err| EventStoreError::storage("EVS-l0Hqe", err))?;
            Ok(latest as u64)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EventStoreError::cancelled("EVS-s6Boy")),
            result = fetch => result,
        }
    }
}

/// Appends the WHERE clause for `query`, returning the number of
/// placeholders emitted. The callers' bind chains must follow the same
/// predicate order.
fn where_clause(sql: &mut String, query: &SearchQuery) -> usize {
    let mut params = 0;
    let mut push = |sql: &mut String, clause: &str| {
        params += 1;
        sql.push_str(if params == 1 { " WHERE " } else { " AND " });
        sql.push_str(&clause.replace("$n", &format!("${params}")));
    };

    push(sql, "aggregate_type = ANY($n)");
    if !query.aggregate_ids.is_empty() {
        push(sql, "aggregate_id = ANY($n)");
    }
    if !query.event_types.is_empty() {
        push(sql, "event_type = ANY($n)");
    }
    if !query.resource_owners.is_empty() {
        push(sql, "resource_owner = ANY($n)");
    }
    if query.sequence_greater > 0 {
        push(sql, "sequence > $n");
    }
    if query.sequence_at_most.is_some() {
        push(sql, "sequence <= $n");
    }
    if let Some(predicates) = &query.event_data {
        for _ in predicates {
            push(sql, "data @> $n");
        }
    }
    params
}

/// Builds the JSONB containment object for one data predicate: dotted
/// keys nest, so `"config.clientId" == "c1"` becomes
/// `{"config":{"clientId":"c1"}}`.
fn containment(key: &str, value: &Value) -> Value {
    let mut acc = value.clone();
    for part in key.rsplit('.') {
        let mut object = serde_json::Map::new();
        object.insert(part.to_owned(), acc);
        acc = Value::Object(object);
    }
    acc
}

/// Serialization failures and other database errors on the push path are
/// storage failures; the assertion check is the only source of
/// `Concurrency` here.
fn push_error(err: sqlx::Error) -> EventStoreError {
    EventStoreError::storage("EVS-d3Aiv", err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SearchQueryBuilder;
    use serde_json::json;

    #[test]
    fn containment_nests_dotted_keys() {
        assert_eq!(containment("userId", &json!("u1")), json!({"userId": "u1"}));
        assert_eq!(
            containment("config.clientId", &json!("c1")),
            json!({"config": {"clientId": "c1"}})
        );
    }

    #[test]
    fn where_clause_numbers_placeholders_in_bind_order() {
        let mut predicates = serde_json::Map::new();
        predicates.insert("userId".to_owned(), json!("u1"));
        let query = SearchQueryBuilder::new(["iam"])
            .aggregate_ids(["iam-1"])
            .sequence_greater(3)
            .event_data(predicates)
            .build()
            .unwrap();

        let mut sql = String::new();
        let params = where_clause(&mut sql, &query);
        assert_eq!(params, 4);
        assert_eq!(
            sql,
            " WHERE aggregate_type = ANY($1) AND aggregate_id = ANY($2) \
             AND sequence > $3 AND data @> $4"
        );
    }
}
