//! The event-log contract.

use covalent_types::{EventId, Registration};
use serde_json::Value;

use crate::error::BackendError;

/// Callback receiving each log record in total order.
pub type EventHandler = Box<dyn FnMut(EventId, &Value) + Send>;

/// An append-only, totally-ordered log of opaque change records.
///
/// Every subscriber observes the same records in the same order. Delivery of
/// a record happens exactly once per subscriber: the catch-up replay on
/// subscribe and the live stream meet without loss or duplication.
pub trait EventLog: Send + Sync {
    /// Appends a record. The record is fanned out to all subscribers before
    /// or after this call returns, in log order either way.
    fn submit_event(&self, id: EventId, payload: Value) -> Result<(), BackendError>;

    /// Subscribes to the log.
    ///
    /// Replays all records strictly after `since` (or every retained record
    /// when `None`), then streams subsequent ones. Fails with
    /// [`BackendError::EventIdNotFound`] when `since` is no longer in the
    /// log.
    fn subscribe(
        &self,
        since: Option<EventId>,
        handler: EventHandler,
    ) -> Result<Registration, BackendError>;

    /// Discards records up to and including `id`.
    ///
    /// Advisory and idempotent: when the log no longer contains `id`, this
    /// is a no-op.
    fn truncate(&self, id: EventId);
}
