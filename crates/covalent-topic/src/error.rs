//! Topic runtime error types.

use covalent_backend::BackendError;
use thiserror::Error;

use crate::snapshot::SnapshotError;

/// Errors surfaced by the topic runtime.
#[derive(Debug, Error)]
pub enum TopicError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The log kept truncating past every snapshot we loaded; gave up
    /// after the configured number of reload attempts.
    #[error("gave up subscribing to topic {topic_id:?} after {attempts} snapshot reloads")]
    SnapshotRetriesExhausted { topic_id: String, attempts: u32 },
}
