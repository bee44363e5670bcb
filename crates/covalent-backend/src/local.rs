//! In-process backend: shared log hub and per-node handles.
//!
//! A [`LogHub`] owns the actual logs and the snapshot store. Each
//! [`LocalBackend`] is one node's view onto a hub: it carries the node
//! identity, fences the node's writes once it has left, and announces
//! join/leave on the membership log.
//!
//! # Delivery model
//!
//! `LocalEventLog` serializes fan-out with a single-drainer loop: the
//! submitter that finds the log idle becomes the drainer and delivers
//! pending records in order; concurrent submitters append and return.
//! Handlers are invoked outside the log lock, so a handler may re-enter
//! `submit_event` (the drainer picks the new record up on its next pass).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use covalent_types::{EventId, NodeId, Registration};
use serde_json::Value;

use crate::Backend;
use crate::error::BackendError;
use crate::log::{EventHandler, EventLog};
use crate::membership::MembershipEvent;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// LocalEventLog
// ============================================================================

struct LogSubscriber {
    id: u64,
    handler: EventHandler,
}

struct LogInner {
    /// Retained records; the record at index `i` sits at absolute position
    /// `base + i`.
    records: VecDeque<(EventId, Value)>,
    /// Number of records discarded by truncation.
    base: u64,
    /// ID of the most recently truncated record. A subscriber resuming from
    /// exactly this ID starts at `base` (the snapshot-cutoff case).
    truncation_id: Option<EventId>,
    /// Absolute position one past the last record handed to subscribers.
    delivered: u64,
    /// True while some thread is draining; at most one drainer at a time.
    delivering: bool,
    subscribers: Vec<LogSubscriber>,
    /// Subscriber ids unsubscribed while the drainer had the list checked
    /// out; dropped at merge-back.
    removed: Vec<u64>,
    next_subscriber_id: u64,
}

/// The hub-owned implementation of [`EventLog`].
pub(crate) struct LocalEventLog {
    inner: Arc<Mutex<LogInner>>,
}

impl LocalEventLog {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                records: VecDeque::new(),
                base: 0,
                truncation_id: None,
                delivered: 0,
                delivering: false,
                subscribers: Vec::new(),
                removed: Vec::new(),
                next_subscriber_id: 0,
            })),
        }
    }

    /// Delivers records until the pending tail is empty.
    ///
    /// Called with `delivering` already set by the caller. The guard is
    /// released around each handler invocation.
    fn drain<'a>(&'a self, mut inner: MutexGuard<'a, LogInner>) {
        loop {
            let index = usize::try_from(inner.delivered - inner.base).expect("log fits in memory");
            if index >= inner.records.len() {
                inner.delivering = false;
                return;
            }

            // Advance the watermark before releasing the lock: a subscriber
            // arriving mid-delivery replays up to (and including) the
            // in-flight record and is only merged in for subsequent ones.
            let (id, payload) = inner.records[index].clone();
            inner.delivered += 1;
            let mut subscribers = std::mem::take(&mut inner.subscribers);
            drop(inner);

            for subscriber in &mut subscribers {
                (subscriber.handler)(id, &payload);
            }

            inner = lock(&self.inner);
            let added = std::mem::take(&mut inner.subscribers);
            subscribers.extend(added);
            let removed = std::mem::take(&mut inner.removed);
            subscribers.retain(|s| !removed.contains(&s.id));
            inner.subscribers = subscribers;
        }
    }

    fn unsubscribe(inner: &Arc<Mutex<LogInner>>, subscriber_id: u64) {
        let mut inner = lock(inner);
        if let Some(position) = inner.subscribers.iter().position(|s| s.id == subscriber_id) {
            inner.subscribers.remove(position);
        } else {
            // The drainer has the list checked out; flag for merge-back.
            inner.removed.push(subscriber_id);
        }
    }
}

impl EventLog for LocalEventLog {
    fn submit_event(&self, id: EventId, payload: Value) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        inner.records.push_back((id, payload));
        if inner.delivering {
            // The active drainer will pick this record up in order.
            return Ok(());
        }
        inner.delivering = true;
        self.drain(inner);
        Ok(())
    }

    fn subscribe(
        &self,
        since: Option<EventId>,
        mut handler: EventHandler,
    ) -> Result<Registration, BackendError> {
        let mut inner = lock(&self.inner);

        let start = match since {
            None => inner.base,
            Some(id) if inner.truncation_id == Some(id) => inner.base,
            Some(id) => {
                let position = inner
                    .records
                    .iter()
                    .position(|(record_id, _)| *record_id == id)
                    .ok_or(BackendError::EventIdNotFound(id))?;
                inner.base + position as u64 + 1
            }
        };

        // Catch-up: everything already delivered, strictly after `since`.
        // Records submitted but not yet drained arrive via the live stream.
        for absolute in start..inner.delivered {
            let index = usize::try_from(absolute - inner.base).expect("log fits in memory");
            let (id, payload) = &inner.records[index];
            handler(*id, payload);
        }

        let subscriber_id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(LogSubscriber {
            id: subscriber_id,
            handler,
        });
        drop(inner);

        let weak = Arc::downgrade(&self.inner);
        Ok(Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                LocalEventLog::unsubscribe(&inner, subscriber_id);
            }
        }))
    }

    fn truncate(&self, id: EventId) {
        let mut inner = lock(&self.inner);
        // Only a fully delivered prefix may go; an undelivered record is
        // still owed to subscribers.
        let delivered_len = usize::try_from(inner.delivered - inner.base).expect("fits");
        let Some(position) = inner
            .records
            .iter()
            .take(delivered_len)
            .position(|(record_id, _)| *record_id == id)
        else {
            return;
        };
        inner.records.drain(..=position);
        inner.base += position as u64 + 1;
        inner.truncation_id = Some(id);
    }
}

// ============================================================================
// LogHub
// ============================================================================

struct HubInner {
    logs: HashMap<String, Arc<LocalEventLog>>,
    membership: Arc<LocalEventLog>,
    snapshots: HashMap<String, Bytes>,
    /// Per-node departure flags; set once, checked by the node's log
    /// handles.
    departures: HashMap<NodeId, Arc<AtomicBool>>,
}

/// Shared substrate for one or more [`LocalBackend`] nodes.
///
/// Cloning a hub clones the handle, not the state.
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                logs: HashMap::new(),
                membership: Arc::new(LocalEventLog::new()),
                snapshots: HashMap::new(),
                departures: HashMap::new(),
            })),
        }
    }

    fn event_log(&self, topic_id: &str) -> Arc<LocalEventLog> {
        let mut inner = lock(&self.inner);
        Arc::clone(
            inner
                .logs
                .entry(topic_id.to_string())
                .or_insert_with(|| Arc::new(LocalEventLog::new())),
        )
    }

    fn membership_log(&self) -> Arc<LocalEventLog> {
        Arc::clone(&lock(&self.inner).membership)
    }

    fn register_node(&self, node_id: NodeId) -> Arc<AtomicBool> {
        let departed = Arc::new(AtomicBool::new(false));
        let membership = {
            let mut inner = lock(&self.inner);
            inner.departures.insert(node_id, Arc::clone(&departed));
            Arc::clone(&inner.membership)
        };
        membership
            .submit_event(EventId::random(), MembershipEvent::Join { node_id }.to_payload())
            .expect("hub membership log accepts joins");
        departed
    }

    /// Declares a node dead: fences its further writes and emits `LEAVE` on
    /// the membership log. Idempotent.
    ///
    /// This is the failure-detector hook; a graceful shutdown goes through
    /// [`LocalBackend::leave`], which ends up here as well.
    pub fn drop_node(&self, node_id: NodeId) {
        let membership = {
            let inner = lock(&self.inner);
            let Some(departed) = inner.departures.get(&node_id) else {
                return;
            };
            if departed.swap(true, Ordering::SeqCst) {
                return;
            }
            Arc::clone(&inner.membership)
        };
        tracing::debug!(%node_id, "node dropped from hub");
        let _ = membership.submit_event(
            EventId::random(),
            MembershipEvent::Leave { node_id }.to_payload(),
        );
    }

    fn latest_snapshot(&self, topic_id: &str) -> Option<Bytes> {
        lock(&self.inner).snapshots.get(topic_id).cloned()
    }

    fn store_snapshot(&self, topic_id: &str, snapshot: Bytes) {
        lock(&self.inner)
            .snapshots
            .insert(topic_id.to_string(), snapshot);
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// LocalBackend
// ============================================================================

/// Log handle scoped to one node: writes are fenced once the node departs.
struct NodeScopedLog {
    node_id: NodeId,
    departed: Arc<AtomicBool>,
    log: Arc<LocalEventLog>,
}

impl EventLog for NodeScopedLog {
    fn submit_event(&self, id: EventId, payload: Value) -> Result<(), BackendError> {
        if self.departed.load(Ordering::SeqCst) {
            return Err(BackendError::NodeDeparted(self.node_id));
        }
        self.log.submit_event(id, payload)
    }

    fn subscribe(
        &self,
        since: Option<EventId>,
        handler: EventHandler,
    ) -> Result<Registration, BackendError> {
        self.log.subscribe(since, handler)
    }

    fn truncate(&self, id: EventId) {
        self.log.truncate(id);
    }
}

/// One node of the in-process backend.
pub struct LocalBackend {
    node_id: NodeId,
    hub: LogHub,
    departed: Arc<AtomicBool>,
    shared: bool,
}

impl LocalBackend {
    /// A standalone single-node backend with a private hub.
    pub fn new() -> Self {
        let hub = LogHub::new();
        let node_id = NodeId::random();
        let departed = hub.register_node(node_id);
        Self {
            node_id,
            hub,
            departed,
            shared: false,
        }
    }

    /// A new node attached to an existing hub.
    pub fn attached_to(hub: &LogHub) -> Self {
        let node_id = NodeId::random();
        let departed = hub.register_node(node_id);
        Self {
            node_id,
            hub: hub.clone(),
            departed,
            shared: true,
        }
    }

    /// The hub this backend is attached to.
    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    /// Gracefully leaves the cluster: emits `LEAVE` and fences this node's
    /// further writes.
    pub fn leave(&self) {
        self.hub.drop_node(self.node_id);
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LocalBackend {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn open_event_log(&self, topic_id: &str) -> Arc<dyn EventLog> {
        Arc::new(NodeScopedLog {
            node_id: self.node_id,
            departed: Arc::clone(&self.departed),
            log: self.hub.event_log(topic_id),
        })
    }

    fn membership_log(&self) -> Arc<dyn EventLog> {
        Arc::new(NodeScopedLog {
            node_id: self.node_id,
            departed: Arc::clone(&self.departed),
            log: self.hub.membership_log(),
        })
    }

    fn load_latest_snapshot(&self, topic_id: &str) -> Result<Option<Bytes>, BackendError> {
        Ok(self.hub.latest_snapshot(topic_id))
    }

    fn submit_snapshot(&self, topic_id: &str, snapshot: Bytes) -> Result<(), BackendError> {
        if self.departed.load(Ordering::SeqCst) {
            return Err(BackendError::NodeDeparted(self.node_id));
        }
        self.hub.store_snapshot(topic_id, snapshot);
        Ok(())
    }

    fn is_shared(&self) -> bool {
        self.shared
    }
}
