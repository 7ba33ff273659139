//! Watermark rows of `projections.current_states`.

use chrono::{DateTime, Utc};
use eventstore::DomainEvent;
use sqlx::{Postgres, Row, Transaction};

use crate::error::{ProjectionError, Result};

/// The watermark probe. `FOR UPDATE NOWAIT` makes competing workers fail
/// fast instead of queueing behind the lock holder.
const CURRENT_STATE_QUERY: &str = "SELECT aggregate_id, aggregate_type, sequence, event_date, position \
     FROM projections.current_states \
     WHERE instance_id = $1 AND projection_name = $2 \
     FOR UPDATE NOWAIT";

const SET_STATE_QUERY: &str = "INSERT INTO projections.current_states \
     (instance_id, projection_name, aggregate_id, aggregate_type, sequence, event_date, position) \
     VALUES ($1, $2, $3, $4, $5, $6, $7) \
     ON CONFLICT (instance_id, projection_name) DO UPDATE SET \
         aggregate_id = EXCLUDED.aggregate_id, \
         aggregate_type = EXCLUDED.aggregate_type, \
         sequence = EXCLUDED.sequence, \
         event_date = EXCLUDED.event_date, \
         position = EXCLUDED.position";

/// Postgres error code for a `NOWAIT` lock that could not be acquired.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// One row of `projections.current_states`: how far a projection got.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionState {
    pub instance_id: String,
    pub projection_name: String,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    pub sequence: u64,
    pub event_date: Option<DateTime<Utc>>,
    pub position: f64,
}

impl ProjectionState {
    pub fn new(instance_id: impl Into<String>, projection_name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            projection_name: projection_name.into(),
            ..Self::default()
        }
    }

    /// Advances the watermark over a batch of mapped events.
    pub fn advance(&mut self, events: &[Box<dyn DomainEvent>]) {
        if let Some(last) = events.last() {
            let header = last.header();
            self.aggregate_id = Some(header.aggregate_id.clone());
            self.aggregate_type = Some(header.aggregate_type.clone());
            self.sequence = header.sequence;
            self.event_date = Some(header.event_date);
            self.position += events.len() as f64;
        }
    }
}

/// Locks and reads the watermark row of one projection. A missing row
/// yields a zero state; a row held by another worker yields
/// [`ProjectionError::Locked`].
pub async fn lock_state(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &str,
    projection_name: &str,
) -> Result<ProjectionState> {
    let row = sqlx::query(CURRENT_STATE_QUERY)
        .bind(instance_id)
        .bind(projection_name)
        .fetch_optional(&mut **tx)
        .await;

    match row {
        Ok(Some(row)) => Ok(ProjectionState {
            instance_id: instance_id.to_owned(),
            projection_name: projection_name.to_owned(),
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence: row.try_get::<i64, _>("sequence")? as u64,
            event_date: row.try_get("event_date")?,
            position: row.try_get("position")?,
        }),
        Ok(None) => Ok(ProjectionState::new(instance_id, projection_name)),
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
            Err(ProjectionError::Locked {
                instance_id: instance_id.to_owned(),
                projection_name: projection_name.to_owned(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

/// Upserts the watermark row inside the caller's transaction.
pub async fn set_state(
    tx: &mut Transaction<'_, Postgres>,
    state: &ProjectionState,
) -> Result<()> {
    sqlx::query(SET_STATE_QUERY)
        .bind(&state.instance_id)
        .bind(&state.projection_name)
        .bind(&state.aggregate_id)
        .bind(&state.aggregate_type)
        .bind(state.sequence as i64)
        .bind(state.event_date)
        .bind(state.position)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_on_an_empty_batch_is_a_no_op() {
        let mut state = ProjectionState::new("default", "iam.member_count");
        let before = state.clone();
        state.advance(&[]);
        assert_eq!(state, before);
    }

    #[test]
    fn probe_statement_must_not_queue() {
        assert!(CURRENT_STATE_QUERY.ends_with("FOR UPDATE NOWAIT"));
        assert!(CURRENT_STATE_QUERY.contains("projections.current_states"));
    }
}
