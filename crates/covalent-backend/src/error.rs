//! Backend error types.

use covalent_types::{EventId, NodeId};
use thiserror::Error;

/// Errors surfaced by a backend or one of its event logs.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A subscription asked to resume after an event ID the log no longer
    /// contains (typically truncated away). The caller retries with a fresh
    /// snapshot.
    #[error("event id {0} not found in the log")]
    EventIdNotFound(EventId),

    /// The submitting node has left the cluster; its writes are fenced off.
    #[error("node {0} has left the cluster")]
    NodeDeparted(NodeId),

    /// The backend refused a submission for an implementation-specific
    /// reason.
    #[error("event log rejected submission: {0}")]
    SubmissionRejected(String),
}
