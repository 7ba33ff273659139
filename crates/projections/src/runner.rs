//! One-shot catch-up driver for projections.

use std::sync::Arc;

use eventstore::Eventstore;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Result;
use crate::projection::Project;
use crate::state::{lock_state, set_state};

/// Drives projections one catch-up iteration at a time.
///
/// Each trigger locks the projection's watermark row (`FOR UPDATE
/// NOWAIT`), gates on the cheap max-sequence probe, folds the events
/// above the watermark and advances the row in the same transaction.
/// Competing workers on the same projection fail fast with
/// [`ProjectionError::Locked`](crate::ProjectionError::Locked).
pub struct ProjectionRunner {
    eventstore: Arc<Eventstore>,
    pool: PgPool,
    instance_id: String,
}

impl ProjectionRunner {
    pub fn new(eventstore: Arc<Eventstore>, pool: PgPool, instance_id: impl Into<String>) -> Self {
        Self {
            eventstore,
            pool,
            instance_id: instance_id.into(),
        }
    }

    /// Runs one catch-up iteration for `projection`. Returns without
    /// folding when the projection is already at the log's head.
    #[instrument(skip_all, fields(projection = projection.name()))]
    pub async fn trigger(
        &self,
        cancel: &CancellationToken,
        projection: &mut dyn Project,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut state = lock_state(&mut tx, &self.instance_id, projection.name()).await?;

        // Index-only gate before any row is mapped.
        let latest = self
            .eventstore
            .latest_sequence(cancel, projection.query())
            .await?;
        if latest <= state.sequence {
            return Ok(());
        }

        let events = self
            .eventstore
            .filter_events(cancel, projection.query().sequence_greater(state.sequence))
            .await?;
        if events.is_empty() {
            return Ok(());
        }

        let processed = events.len() as u64;
        state.advance(&events);
        projection.reduce(events)?;

        set_state(&mut tx, &state).await?;
        tx.commit().await?;

        metrics::counter!("projection_events_processed", "projection" => projection.name())
            .increment(processed);
        tracing::debug!(sequence = state.sequence, "watermark advanced");

        Ok(())
    }
}
