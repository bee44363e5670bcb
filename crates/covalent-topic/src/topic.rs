//! The topic runtime: lock, fan-out, leadership and housekeeping around
//! the pure state machine.
//!
//! A [`Topic`] folds its event log through [`apply_change`] under a single
//! mutex, so all state transitions are serialized per topic. Work that
//! must not run under that mutex (compensating submissions, snapshot
//! uploads, log truncation) is collected as effects during apply handling
//! and executed after the lock is released, in the functional-core /
//! imperative-shell manner.
//!
//! # Leadership
//!
//! The first entry of `backend_nodes` is the leader. Leadership is
//! monotonic: nodes only ever disappear from the list, so once the local
//! node reaches the front it stays there until it leaves itself. Only the
//! leader runs stale-entry sweeps, submits snapshots and prunes expired
//! collections.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use covalent_backend::{Backend, BackendError, EventLog, MembershipEvent};
use covalent_types::{EventId, NodeId, Registration};
use dashmap::DashMap;
use indexmap::IndexSet;

use crate::apply::apply_change;
use crate::change::{ChangeRecord, ChangeResult};
use crate::details::ChangeDetails;
use crate::error::TopicError;
use crate::snapshot::TopicSnapshot;
use crate::state::{ScopedEntryRef, TopicData};

/// The leader snapshots and truncates after this many accepted mutations.
pub const SNAPSHOT_EVERY: u64 = 100;

/// How many times `open` reloads the snapshot when the log has been
/// truncated past the one it just read.
pub const SNAPSHOT_SUBSCRIBE_ATTEMPTS: u32 = 50;

/// Callback observing applied collection changes, invoked under the topic
/// lock. Subscribers must not re-enter the topic synchronously; they
/// dispatch onward through their connection's dispatcher.
pub type ChangeSubscriber = Box<dyn FnMut(EventId, &ChangeDetails) + Send>;

/// One-shot callback receiving a submitted change's verdict.
pub type ResultHandler = Box<dyn FnOnce(ChangeResult) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deferred work collected under the topic lock, executed outside it.
enum Effect {
    /// Submit a change (compensating removals from sweeps/expiration).
    Submit(ChangeRecord),
    /// Capture and upload a snapshot, then truncate the log behind it.
    Snapshot,
}

struct TopicInner {
    data: TopicData,
    subscribers: Vec<(u64, ChangeSubscriber)>,
    next_subscriber_id: u64,
    leader: bool,
    /// Set when `active_nodes` empties, cleared when it repopulates.
    last_disconnected: Option<Instant>,
    latest_applied: Option<EventId>,
    /// Nodes whose membership LEAVE this topic has observed. Snapshots are
    /// filtered against this on load: membership replay happens before the
    /// snapshot is restored, so a restored member list may still carry
    /// nodes that are long gone.
    departed: IndexSet<NodeId>,
}

/// One topic's materialized state plus runtime machinery.
pub struct Topic {
    id: String,
    local_node: NodeId,
    backend: Arc<dyn Backend>,
    log: Arc<dyn EventLog>,
    inner: Mutex<TopicInner>,
    /// Result trackers by tracking ID, consumed exactly once on apply.
    trackers: DashMap<EventId, ResultHandler>,
    /// True while `open` replays the log under the log's lock; effects
    /// raised during replay are parked until the replay finishes.
    replaying: AtomicBool,
    pending_effects: Mutex<Vec<Effect>>,
    registrations: Mutex<Vec<Registration>>,
}

impl Topic {
    /// Opens the topic against a backend: subscribes to membership,
    /// restores the latest snapshot (if any), folds the log tail and
    /// announces the local node.
    ///
    /// When the log has been truncated past the loaded snapshot's cutoff,
    /// the snapshot is reloaded and the subscription retried, up to
    /// [`SNAPSHOT_SUBSCRIBE_ATTEMPTS`] times.
    pub fn open(id: impl Into<String>, backend: Arc<dyn Backend>) -> Result<Arc<Self>, TopicError> {
        let id = id.into();
        let local_node = backend.node_id();
        let log = backend.open_event_log(&id);

        let topic = Arc::new(Self {
            id: id.clone(),
            local_node,
            backend: Arc::clone(&backend),
            log,
            inner: Mutex::new(TopicInner {
                data: TopicData::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                leader: false,
                last_disconnected: None,
                latest_applied: None,
                departed: IndexSet::new(),
            }),
            trackers: DashMap::new(),
            replaying: AtomicBool::new(false),
            pending_effects: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&topic);
        let membership_registration = backend.membership_log().subscribe(
            None,
            Box::new(move |_, payload| {
                if let Some(MembershipEvent::Leave { node_id }) =
                    MembershipEvent::from_payload(payload)
                {
                    if let Some(topic) = weak.upgrade() {
                        topic.handle_node_leave(node_id);
                    }
                }
            }),
        )?;
        lock(&topic.registrations).push(membership_registration);

        let log_registration = topic.restore_and_subscribe()?;
        lock(&topic.registrations).push(log_registration);

        topic.submit(ChangeRecord::NodeJoin {
            node_id: local_node,
        })?;

        tracing::debug!(topic_id = %topic.id, node_id = %local_node, "topic opened");
        Ok(topic)
    }

    /// Snapshot-load-then-subscribe with the bounded retry loop.
    fn restore_and_subscribe(self: &Arc<Self>) -> Result<Registration, TopicError> {
        for attempt in 1..=SNAPSHOT_SUBSCRIBE_ATTEMPTS {
            let since = match self.backend.load_latest_snapshot(&self.id)? {
                Some(blob) => {
                    let snapshot = TopicSnapshot::decode(&blob)?;
                    let latest = snapshot.latest;
                    self.load_snapshot(&snapshot)?;
                    latest
                }
                None => None,
            };

            let weak = Arc::downgrade(self);
            let handler = Box::new(move |id: EventId, payload: &serde_json::Value| {
                if let Some(topic) = weak.upgrade() {
                    topic.on_event(id, payload);
                }
            });

            self.replaying.store(true, Ordering::SeqCst);
            let subscribed = self.log.subscribe(since, handler);
            self.replaying.store(false, Ordering::SeqCst);
            self.flush_replay_effects();

            match subscribed {
                Ok(registration) => return Ok(registration),
                Err(BackendError::EventIdNotFound(id)) => {
                    tracing::debug!(
                        topic_id = %self.id,
                        missing = %id,
                        attempt,
                        "log truncated past snapshot cutoff, reloading"
                    );
                    // Discard the stale restore before loading a newer one.
                    let mut inner = lock(&self.inner);
                    inner.data = TopicData::new();
                    inner.latest_applied = None;
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(TopicError::SnapshotRetriesExhausted {
            topic_id: self.id.clone(),
            attempts: SNAPSHOT_SUBSCRIBE_ATTEMPTS,
        })
    }

    /// Installs a restored snapshot.
    ///
    /// # Panics
    ///
    /// Panics when the topic has already materialized state; snapshots may
    /// only be loaded at construction, before any subscription.
    fn load_snapshot(&self, snapshot: &TopicSnapshot) -> Result<(), TopicError> {
        let mut data = snapshot.restore()?;
        let mut inner = lock(&self.inner);
        assert!(
            inner.data.is_empty(),
            "snapshot loaded into non-empty topic {:?}",
            self.id
        );
        data.backend_nodes
            .retain(|node| !inner.departed.contains(node));
        data.active_nodes
            .retain(|node| !inner.departed.contains(node));
        inner.latest_applied = snapshot.latest;
        inner.leader = data.leader_node() == Some(self.local_node);
        inner.data = data;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn is_leader(&self) -> bool {
        lock(&self.inner).leader
    }

    /// Runs a closure against the current state under the topic lock.
    ///
    /// The closure must copy out whatever it needs; holding borrows beyond
    /// it is impossible by construction.
    pub fn read<R>(&self, f: impl FnOnce(&TopicData) -> R) -> R {
        f(&lock(&self.inner).data)
    }

    /// Submits a change without tracking its verdict.
    pub fn submit(&self, change: ChangeRecord) -> Result<EventId, TopicError> {
        let id = EventId::random();
        self.submit_prepared(id, change, None)?;
        Ok(id)
    }

    /// Submits a change and registers a one-shot result tracker for it.
    ///
    /// The tracker is installed before the submission and consumed exactly
    /// once when the change is applied, whichever node's submission carried
    /// it there.
    pub fn submit_tracked(
        &self,
        change: ChangeRecord,
        on_result: ResultHandler,
    ) -> Result<EventId, TopicError> {
        let id = EventId::random();
        self.submit_prepared(id, change, Some(on_result))?;
        Ok(id)
    }

    /// Submits a change under a caller-allocated tracking ID.
    ///
    /// Callers that must know the ID before the change applies (scoped
    /// entry bookkeeping, list insertions) allocate it themselves and pass
    /// it here.
    pub fn submit_prepared(
        &self,
        id: EventId,
        change: ChangeRecord,
        on_result: Option<ResultHandler>,
    ) -> Result<(), TopicError> {
        if let Some(on_result) = on_result {
            let previous = self.trackers.insert(id, on_result);
            assert!(
                previous.is_none(),
                "duplicate result tracker for change {id}"
            );
        }

        let payload =
            serde_json::to_value(&change).expect("change records are always serializable");
        match self.log.submit_event(id, payload) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.trackers.remove(&id);
                Err(error.into())
            }
        }
    }

    /// Registers a change subscriber.
    ///
    /// `catch_up` runs first, under the same lock acquisition that installs
    /// the subscriber: it sees exactly the state the live stream continues
    /// from, so no change is lost or duplicated across the boundary. As a
    /// leader duty, expired idle collections are pruned first.
    pub fn subscribe(
        self: &Arc<Self>,
        catch_up: impl FnOnce(&TopicData),
        subscriber: ChangeSubscriber,
    ) -> Registration {
        self.clear_expired();

        let subscriber_id = {
            let mut inner = lock(&self.inner);
            let subscriber_id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            catch_up(&inner.data);
            inner.subscribers.push((subscriber_id, subscriber));
            subscriber_id
        };

        let weak = Arc::downgrade(self);
        Registration::new(move || {
            if let Some(topic) = weak.upgrade() {
                let mut inner = lock(&topic.inner);
                inner.subscribers.retain(|(id, _)| *id != subscriber_id);
            }
        })
    }

    /// Applies one log record: fold, bookkeeping, fan-out, tracker, effects.
    fn on_event(&self, id: EventId, payload: &serde_json::Value) {
        let change: ChangeRecord = match serde_json::from_value(payload.clone()) {
            Ok(change) => change,
            Err(error) => {
                tracing::warn!(topic_id = %self.id, %id, %error, "skipping unparseable change record");
                return;
            }
        };

        let mut effects = Vec::new();
        let result = {
            let mut inner = lock(&self.inner);
            let was_active = !inner.data.active_nodes.is_empty();
            let was_leader = inner.leader;

            let outcome = apply_change(&mut inner.data, id, &change);
            inner.latest_applied = Some(id);

            // Leadership can only change on NODE_JOIN here; LEAVE arrives
            // through the membership subscription.
            inner.leader = inner.data.leader_node() == Some(self.local_node);
            if inner.leader && !was_leader {
                tracing::info!(topic_id = %self.id, node_id = %self.local_node, "topic leadership acquired");
                for owner in inner.data.orphaned_scope_owners() {
                    Self::push_compensations(&inner.data, owner, &mut effects);
                }
            }

            // Track the idle window across active-node transitions. The
            // expiration check runs on the wake-up edge, while the idle
            // timestamp is still in place.
            let is_active = !inner.data.active_nodes.is_empty();
            if was_active && !is_active {
                inner.last_disconnected = Some(Instant::now());
            } else if !was_active && is_active {
                if inner.leader {
                    Self::push_expired(&inner, Instant::now(), &mut effects);
                }
                inner.last_disconnected = None;
            }

            if outcome.result.is_accepted() && outcome.details.is_some() {
                let count = inner.data.change_count();
                if inner.leader && count > 0 && count % SNAPSHOT_EVERY == 0 {
                    effects.push(Effect::Snapshot);
                }
            }

            if let Some(details) = &outcome.details {
                Self::fan_out(&mut inner, id, details);
            }
            outcome.result
        };

        if let Some((_, on_result)) = self.trackers.remove(&id) {
            on_result(result);
        }

        self.run_effects(effects);
    }

    /// Notifies subscribers under the topic lock.
    ///
    /// A panicking subscriber is removed so one buggy observer cannot blind
    /// the others; survivors are still invoked and the panic is reported.
    fn fan_out(inner: &mut TopicInner, id: EventId, details: &ChangeDetails) {
        let mut failed = Vec::new();
        for (subscriber_id, subscriber) in &mut inner.subscribers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(id, details))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(
                    subscriber_id = *subscriber_id,
                    %message,
                    "change subscriber panicked, removing it"
                );
                failed.push(*subscriber_id);
            }
        }
        if !failed.is_empty() {
            inner
                .subscribers
                .retain(|(subscriber_id, _)| !failed.contains(subscriber_id));
        }
    }

    /// Membership LEAVE handling: drop the node, take over leadership when
    /// it falls to us, and sweep the departed node's scoped entries.
    fn handle_node_leave(&self, node_id: NodeId) {
        let mut effects = Vec::new();
        {
            let mut inner = lock(&self.inner);
            let was_leader = inner.leader;
            let was_active = !inner.data.active_nodes.is_empty();

            inner.departed.insert(node_id);
            inner.data.backend_nodes.retain(|node| *node != node_id);
            // A dead node cannot deactivate itself; treat the leave as its
            // deactivation so idle expiration still works.
            inner.data.active_nodes.shift_remove(&node_id);
            if was_active && inner.data.active_nodes.is_empty() {
                inner.last_disconnected = Some(Instant::now());
            }

            inner.leader = inner.data.leader_node() == Some(self.local_node);
            if inner.leader && !was_leader {
                tracing::info!(topic_id = %self.id, node_id = %self.local_node, "topic leadership acquired");
            }
            if inner.leader {
                Self::push_compensations(&inner.data, node_id, &mut effects);
            }
        }
        self.run_effects(effects);
    }

    /// Leader duty: prune collections whose idle timeout has elapsed.
    /// No-op while the topic has active nodes.
    fn clear_expired(&self) {
        let mut effects = Vec::new();
        {
            let inner = lock(&self.inner);
            // Expiration only applies to an idle topic; an active one gets
            // pruned on its next idle-to-active edge instead.
            if inner.leader && inner.data.active_nodes.is_empty() {
                Self::push_expired(&inner, Instant::now(), &mut effects);
            }
        }
        self.run_effects(effects);
    }

    /// Collects compensating removals for every scoped entry of `owner`.
    fn push_compensations(data: &TopicData, owner: NodeId, effects: &mut Vec<Effect>) {
        for entry in data.scoped_entries_of(owner) {
            let change = match entry {
                ScopedEntryRef::Map { name, key, revision } => {
                    ChangeRecord::compensate_map(&name, &key, revision)
                }
                ScopedEntryRef::List { name, key, revision } => {
                    ChangeRecord::compensate_list(&name, key, revision)
                }
            };
            effects.push(Effect::Submit(change));
        }
    }

    /// Collects compensating removals for every entry of every collection
    /// whose idle timeout has elapsed.
    fn push_expired(inner: &TopicInner, now: Instant, effects: &mut Vec<Effect>) {
        let Some(since) = inner.last_disconnected else {
            return;
        };
        let idle = now.saturating_duration_since(since);

        for (name, timeout) in &inner.data.map_timeouts {
            if *timeout > idle {
                continue;
            }
            if let Some(map) = inner.data.map(name) {
                for (key, entry) in map {
                    effects.push(Effect::Submit(ChangeRecord::compensate_map(
                        name,
                        key,
                        entry.revision,
                    )));
                }
            }
        }
        for (name, timeout) in &inner.data.list_timeouts {
            if *timeout > idle {
                continue;
            }
            if let Some(list) = inner.data.list(name) {
                for (key, entry) in list.iter() {
                    effects.push(Effect::Submit(ChangeRecord::compensate_list(
                        name,
                        key,
                        entry.revision,
                    )));
                }
            }
        }
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        if self.replaying.load(Ordering::SeqCst) {
            lock(&self.pending_effects).extend(effects);
            return;
        }
        for effect in effects {
            match effect {
                Effect::Submit(change) => {
                    if let Err(error) = self.submit(change) {
                        tracing::warn!(topic_id = %self.id, %error, "compensating submission failed");
                    }
                }
                Effect::Snapshot => self.submit_snapshot_now(),
            }
        }
    }

    fn flush_replay_effects(&self) {
        let pending = std::mem::take(&mut *lock(&self.pending_effects));
        self.run_effects(pending);
    }

    /// Captures, uploads and truncates behind the current state.
    fn submit_snapshot_now(&self) {
        let (snapshot, latest) = {
            let inner = lock(&self.inner);
            let latest = inner.latest_applied;
            (TopicSnapshot::capture(&inner.data, latest), latest)
        };

        let blob = match snapshot.encode() {
            Ok(blob) => blob,
            Err(error) => {
                tracing::warn!(topic_id = %self.id, %error, "snapshot encoding failed");
                return;
            }
        };
        match self.backend.submit_snapshot(&self.id, blob) {
            Ok(()) => {
                if let Some(latest) = latest {
                    self.log.truncate(latest);
                }
                tracing::debug!(topic_id = %self.id, latest = ?latest, "snapshot submitted, log truncated");
            }
            Err(error) => {
                tracing::warn!(topic_id = %self.id, %error, "snapshot submission failed");
            }
        }
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        for registration in lock(&self.registrations).drain(..) {
            registration.remove();
        }
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.id)
            .field("local_node", &self.local_node)
            .finish_non_exhaustive()
    }
}
