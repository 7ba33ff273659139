//! Long-lived projections over the event log.
//!
//! A projection folds the stream into externally persisted state and
//! tracks its progress in a `projections.current_states` watermark row.
//! The runner locks that row with `FOR UPDATE NOWAIT`, so competing
//! workers fail fast instead of queueing.

pub mod error;
pub mod projection;
pub mod runner;
pub mod state;

pub use error::{ProjectionError, Result};
pub use projection::Project;
pub use runner::ProjectionRunner;
pub use state::{ProjectionState, lock_state, set_state};
