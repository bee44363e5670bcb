//! # covalent-topic: Topic state machine and runtime
//!
//! A topic is a named, isolated coordination namespace whose state is the
//! fold of its event log. This crate supplies both halves of that
//! sentence:
//!
//! - the **pure core**: [`ChangeRecord`] (the wire form of every
//!   mutation), [`TopicData`] (named maps, doubly-linked named lists,
//!   timeouts, membership) and [`apply_change`], a deterministic function
//!   with no IO, clocks or randomness;
//! - the **runtime shell**: [`Topic`], which serializes everything on one
//!   mutex, fans applied changes out to subscribers, resolves result
//!   trackers, elects the housekeeping leader, sweeps state left by
//!   departed nodes, prunes idle-expired collections and snapshots the
//!   log every [`SNAPSHOT_EVERY`] mutations.
//!
//! Connections and contexts live one crate up, in `covalent`.

pub mod apply;
pub mod change;
pub mod details;
pub mod error;
pub mod snapshot;
pub mod state;
pub mod topic;

#[cfg(test)]
mod tests;

pub use apply::{ApplyOutcome, apply_change};
pub use change::{AdjacencyCondition, ChangeRecord, ChangeResult};
pub use details::{ChangeDetails, ListChange, ListChangeKind, MapChange};
pub use error::TopicError;
pub use snapshot::{SnapshotError, SnapshotListEntry, TopicSnapshot};
pub use state::{ListData, ListEntry, MapEntry, TopicData};
pub use topic::{ChangeSubscriber, ResultHandler, SNAPSHOT_EVERY, Topic};
