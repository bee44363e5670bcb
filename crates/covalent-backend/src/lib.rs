//! # covalent-backend: Backend SPI and local substrate
//!
//! A backend supplies the ordered substrate a topic runtime is built on:
//!
//! - one append-only, totally-ordered [`EventLog`] per topic name
//! - a cluster-wide membership log carrying [`MembershipEvent`] records
//! - a snapshot store (latest blob per topic)
//! - the local node identity
//!
//! The in-process implementation lives in [`local`]: a [`LogHub`] holds the
//! shared logs and snapshot store, and any number of [`LocalBackend`] nodes
//! can attach to one hub. A single detached `LocalBackend` is the
//! single-node deployment; several backends on a shared hub model a cluster
//! within one process (and drive the failover tests).

pub mod error;
pub mod local;
pub mod log;
pub mod membership;

pub use error::BackendError;
pub use local::{LocalBackend, LogHub};
pub use log::{EventHandler, EventLog};
pub use membership::MembershipEvent;

use std::sync::Arc;

use bytes::Bytes;
use covalent_types::NodeId;

/// The pluggable substrate a topic runtime runs against.
///
/// Implementations must provide total order per log: every subscriber of a
/// log observes the same records in the same order, and a record is applied
/// at most once per subscriber.
pub trait Backend: Send + Sync {
    /// The local node's identity, stable for the backend's lifetime.
    fn node_id(&self) -> NodeId;

    /// Opens (or creates) the event log of the named topic.
    fn open_event_log(&self, topic_id: &str) -> Arc<dyn EventLog>;

    /// The cluster-wide membership log.
    fn membership_log(&self) -> Arc<dyn EventLog>;

    /// Loads the most recent snapshot submitted for the topic, if any.
    fn load_latest_snapshot(&self, topic_id: &str) -> Result<Option<Bytes>, BackendError>;

    /// Stores a snapshot blob as the topic's latest.
    fn submit_snapshot(&self, topic_id: &str, snapshot: Bytes) -> Result<(), BackendError>;

    /// True when this backend shares its logs with other nodes.
    ///
    /// Drives behavior that must be deterministic across the cluster, such
    /// as user color assignment.
    fn is_shared(&self) -> bool;
}
