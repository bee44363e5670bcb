//! Topic connections: the per-consumer handle onto a topic.
//!
//! A connection mediates reads, authored mutations, subscriptions and
//! connection-scoped entries for one consumer. Its lifecycle follows the
//! owning context:
//!
//! ```text
//! created ──(dispatcher)──► active ──(cleanup)──► deactivated ──► closed
//! ```
//!
//! Both transitions are tolerant of racing activate/deactivate pairs: the
//! intent flag flips immediately and the transition work is dispatched
//! stamped with the transition's epoch. A queued action whose epoch has
//! been superseded by a newer transition exits without effect, so a rapid
//! activate/deactivate/activate burst still runs each transition body at
//! most once.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use covalent_topic::{ChangeDetails, ChangeRecord, ListChangeKind, Topic};
use covalent_types::{EventId, ListKey, Registration, UserInfo};

use crate::completion::{Completion, PendingOps};
use crate::error::EngineError;
use crate::executor::ActionDispatcher;
use crate::list::{ListChangeEvent, SharedList};
use crate::map::{MapChangeEvent, SharedMap};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// User callback run on every activation, receiving the live connection.
pub type ActivationCallback = Box<dyn FnMut(&Arc<TopicConnection>) + Send>;

/// Engine hook observing this connection's activation edges.
pub(crate) type TopicActivationHandler = Box<dyn Fn(bool) + Send + Sync>;

pub(crate) type MapSubscriber = Box<dyn FnMut(&MapChangeEvent) + Send>;
pub(crate) type ListSubscriber = Box<dyn FnMut(&ListChangeEvent) + Send>;

/// Identifies a connection-scoped entry this connection wrote.
#[derive(Clone)]
pub(crate) enum ScopedKey {
    Map(String, String),
    List(String, ListKey),
}

// ============================================================================
// Failure surface
// ============================================================================

type FailureHandler = Box<dyn FnOnce(Arc<EngineError>) + Send>;

struct FailureState {
    error: Option<Arc<EngineError>>,
    handler: Option<FailureHandler>,
}

/// One-shot backend-failure signal shared between a connection and its
/// handle. The first reported error wins.
pub(crate) struct FailureCell {
    inner: Mutex<FailureState>,
}

impl FailureCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FailureState {
                error: None,
                handler: None,
            }),
        })
    }

    pub(crate) fn report(&self, error: EngineError) {
        let error = Arc::new(error);
        let handler = {
            let mut state = lock(&self.inner);
            if state.error.is_some() {
                return;
            }
            state.error = Some(Arc::clone(&error));
            state.handler.take()
        };
        if let Some(handler) = handler {
            handler(error);
        }
    }

    pub(crate) fn on_failure(&self, handler: FailureHandler) {
        let fired = {
            let mut state = lock(&self.inner);
            match &state.error {
                Some(error) => Some(Arc::clone(error)),
                None => {
                    state.handler = Some(handler);
                    return;
                }
            }
        };
        if let Some(error) = fired {
            handler(error);
        }
    }
}

// ============================================================================
// TopicConnection
// ============================================================================

struct ConnectionState {
    /// True between a completed activation body and the matching completed
    /// deactivation body. Transition bodies whose work has already been
    /// done (their counterpart was superseded mid-burst) skip themselves,
    /// so the engine hook and the topic subscription see each logical
    /// activation exactly once.
    engaged: bool,
    dispatcher: Option<ActionDispatcher>,
    topic_subscription: Option<Registration>,
    map_subscribers: HashMap<String, Vec<(u64, Arc<Mutex<MapSubscriber>>)>>,
    list_subscribers: HashMap<String, Vec<(u64, Arc<Mutex<ListSubscriber>>)>>,
    next_subscriber: u64,
    /// `(map name, key) → revision` of connection-scoped entries we wrote.
    scoped_map: HashMap<(String, String), EventId>,
    scoped_list: HashMap<(String, ListKey), EventId>,
}

/// A consumer's handle onto one topic.
pub struct TopicConnection {
    topic: Arc<Topic>,
    user: UserInfo,
    pending: Arc<PendingOps>,
    /// Wants-active intent; drives the edge detection in
    /// [`TopicConnection::accept_dispatcher`].
    activated: AtomicBool,
    /// Bumped on every lifecycle transition. Queued transition actions
    /// carry the epoch they were dispatched under and bail out once a
    /// newer transition has superseded them.
    epoch: AtomicU64,
    closed: AtomicBool,
    state: Mutex<ConnectionState>,
    topic_activation: TopicActivationHandler,
    on_activation: Mutex<ActivationCallback>,
    failure: Arc<FailureCell>,
}

impl TopicConnection {
    pub(crate) fn new(
        topic: Arc<Topic>,
        user: UserInfo,
        pending: Arc<PendingOps>,
        topic_activation: TopicActivationHandler,
        on_activation: ActivationCallback,
        failure: Arc<FailureCell>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic,
            user,
            pending,
            activated: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                engaged: false,
                dispatcher: None,
                topic_subscription: None,
                map_subscribers: HashMap::new(),
                list_subscribers: HashMap::new(),
                next_subscriber: 0,
                scoped_map: HashMap::new(),
                scoped_list: HashMap::new(),
            }),
            topic_activation,
            on_activation: Mutex::new(on_activation),
            failure,
        })
    }

    pub fn topic_id(&self) -> &str {
        self.topic.id()
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn is_active(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// The named map of this connection's topic.
    pub fn named_map(self: &Arc<Self>, name: impl Into<String>) -> SharedMap {
        SharedMap::new(Arc::clone(self), name.into())
    }

    /// The named list of this connection's topic.
    pub fn named_list(self: &Arc<Self>, name: impl Into<String>) -> SharedList {
        SharedList::new(Arc::clone(self), name.into())
    }

    /// The underlying topic runtime (shared by every connection onto it).
    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    pub(crate) fn pending(&self) -> &Arc<PendingOps> {
        &self.pending
    }

    pub(crate) fn failure(&self) -> &Arc<FailureCell> {
        &self.failure
    }

    /// The context's activation handler: `Some` activates, `None`
    /// deactivates. Edges flip the intent flag and bump the epoch
    /// immediately; the transition body runs on the dispatcher under the
    /// epoch it was dispatched with.
    pub(crate) fn accept_dispatcher(self: &Arc<Self>, dispatcher: Option<ActionDispatcher>) {
        match dispatcher {
            Some(dispatcher) => {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                if self.activated.swap(true, Ordering::SeqCst) {
                    return;
                }
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                let connection = Arc::clone(self);
                let installed = dispatcher.clone();
                dispatcher.dispatch(move || connection.handle_activate(installed, epoch));
            }
            None => {
                if !self.activated.swap(false, Ordering::SeqCst) {
                    return;
                }
                // Bumping the epoch first invalidates a still-queued
                // activation even when there is nothing to dispatch.
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                // No installed dispatcher means the activation action has
                // not run yet; its stale epoch makes it exit without
                // effect, leaving nothing to clean up.
                let Some(dispatcher) = lock(&self.state).dispatcher.clone() else {
                    return;
                };
                let connection = Arc::clone(self);
                dispatcher.dispatch(move || connection.handle_deactivate(epoch));
            }
        }
    }

    /// Closes the connection for good, deactivating it first if needed.
    pub(crate) fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accept_dispatcher(None);
    }

    fn handle_activate(self: Arc<Self>, dispatcher: ActionDispatcher, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            // A newer transition superseded this queued activation.
            return;
        }
        {
            let mut state = lock(&self.state);
            if state.engaged {
                // The matching deactivation was superseded mid-burst; the
                // connection never actually went down.
                return;
            }
            state.engaged = true;
            state.dispatcher = Some(dispatcher);
        }

        (self.topic_activation)(true);

        let weak = Arc::downgrade(&self);
        let registration = self.topic.subscribe(
            |_| {},
            Box::new(move |id, details| {
                if let Some(connection) = weak.upgrade() {
                    connection.on_topic_change(id, details);
                }
            }),
        );
        if let Some(stale) = lock(&self.state).topic_subscription.replace(registration) {
            stale.remove();
        }

        let mut on_activation = lock(&self.on_activation);
        if catch_unwind(AssertUnwindSafe(|| (*on_activation)(&self))).is_err() {
            drop(on_activation);
            tracing::error!(topic_id = %self.topic.id(), "activation callback panicked, closing connection");
            self.close();
        }
    }

    fn handle_deactivate(self: Arc<Self>, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            // Reactivated (or re-transitioned) before this queued
            // deactivation ran.
            return;
        }

        // Compensate connection-scoped entries before deactivation is
        // reported anywhere else.
        let (scoped_map, scoped_list, subscription) = {
            let mut state = lock(&self.state);
            if !state.engaged {
                // The matching activation was superseded; nothing was set
                // up for this cycle.
                return;
            }
            state.engaged = false;
            (
                std::mem::take(&mut state.scoped_map),
                std::mem::take(&mut state.scoped_list),
                state.topic_subscription.take(),
            )
        };
        for ((name, key), revision) in scoped_map {
            if let Err(error) = self
                .topic
                .submit(ChangeRecord::compensate_map(&name, &key, revision))
            {
                tracing::warn!(topic_id = %self.topic.id(), %error, "scoped map cleanup failed");
            }
        }
        for ((name, key), revision) in scoped_list {
            if let Err(error) = self
                .topic
                .submit(ChangeRecord::compensate_list(&name, key, revision))
            {
                tracing::warn!(topic_id = %self.topic.id(), %error, "scoped list cleanup failed");
            }
        }

        if let Some(subscription) = subscription {
            subscription.remove();
        }
        {
            let mut state = lock(&self.state);
            state.map_subscribers.clear();
            state.list_subscribers.clear();
            state.dispatcher = None;
        }

        (self.topic_activation)(false);
    }

    /// The connection's raw topic subscriber. Runs under the topic lock:
    /// maintains scoped-entry bookkeeping, snapshots the matching consumer
    /// subscribers and dispatches delivery onto the connection's queue.
    fn on_topic_change(self: &Arc<Self>, id: EventId, details: &ChangeDetails) {
        match details {
            ChangeDetails::Map(change) => {
                let mut state = lock(&self.state);
                let scoped_key = (change.name.clone(), change.key.clone());
                if let Some(revision) = state.scoped_map.get(&scoped_key) {
                    // A rewrite by any other change (or a removal) ends our
                    // responsibility for the entry.
                    if change.new_value.is_null() || *revision != id {
                        state.scoped_map.remove(&scoped_key);
                    }
                }

                let subscribers = state
                    .map_subscribers
                    .get(&change.name)
                    .cloned()
                    .unwrap_or_default();
                let dispatcher = state.dispatcher.clone();
                drop(state);

                if subscribers.is_empty() {
                    return;
                }
                let Some(dispatcher) = dispatcher else { return };
                let event = MapChangeEvent {
                    key: change.key.clone(),
                    old_value: change.old_value.clone(),
                    value: change.new_value.clone(),
                };
                let connection = Arc::clone(self);
                dispatcher.dispatch(move || connection.deliver_map_event(&event, &subscribers));
            }
            ChangeDetails::List(change) => {
                let mut state = lock(&self.state);
                let scoped_key = (change.name.clone(), change.key);
                if let Some(revision) = state.scoped_list.get(&scoped_key) {
                    if change.value.is_null() || *revision != id {
                        state.scoped_list.remove(&scoped_key);
                    }
                }

                let subscribers = state
                    .list_subscribers
                    .get(&change.name)
                    .cloned()
                    .unwrap_or_default();
                let dispatcher = state.dispatcher.clone();
                drop(state);

                if subscribers.is_empty() {
                    return;
                }
                let Some(dispatcher) = dispatcher else { return };
                let event = ListChangeEvent {
                    key: change.key,
                    kind: change.kind,
                    old_value: change.old_value.clone(),
                    value: change.value.clone(),
                    prev: change.prev,
                    next: change.next,
                };
                let connection = Arc::clone(self);
                dispatcher.dispatch(move || connection.deliver_list_event(&event, &subscribers));
            }
        }
    }

    fn deliver_map_event(
        self: &Arc<Self>,
        event: &MapChangeEvent,
        subscribers: &[(u64, Arc<Mutex<MapSubscriber>>)],
    ) {
        for (_, subscriber) in subscribers {
            let mut handler = lock(subscriber);
            if catch_unwind(AssertUnwindSafe(|| (*handler)(event))).is_err() {
                drop(handler);
                tracing::error!(topic_id = %self.topic.id(), "map subscriber panicked, closing connection");
                self.close();
                return;
            }
        }
    }

    fn deliver_list_event(
        self: &Arc<Self>,
        event: &ListChangeEvent,
        subscribers: &[(u64, Arc<Mutex<ListSubscriber>>)],
    ) {
        for (_, subscriber) in subscribers {
            let mut handler = lock(subscriber);
            if catch_unwind(AssertUnwindSafe(|| (*handler)(event))).is_err() {
                drop(handler);
                tracing::error!(topic_id = %self.topic.id(), "list subscriber panicked, closing connection");
                self.close();
                return;
            }
        }
    }

    /// The active dispatcher.
    ///
    /// # Panics
    ///
    /// Panics when the connection is not active; operating on an inactive
    /// connection is a programmer error.
    pub(crate) fn current_dispatcher(&self) -> ActionDispatcher {
        lock(&self.state)
            .dispatcher
            .clone()
            .expect("connection is not active")
    }

    /// Registers a map subscriber and dispatches its catch-up delivery.
    ///
    /// Registration, catch-up snapshot and the catch-up dispatch all run
    /// under the topic lock, so the synthetic events and the live stream
    /// meet without loss or duplication: an event applied earlier snapshots
    /// a subscriber list that excludes this one, a later one includes it.
    pub(crate) fn subscribe_map(
        self: &Arc<Self>,
        name: &str,
        subscriber: MapSubscriber,
    ) -> Registration {
        let dispatcher = self.current_dispatcher();
        let subscriber = Arc::new(Mutex::new(subscriber));
        let name = name.to_string();

        let subscriber_id = self.topic.read(|data| {
            let mut state = lock(&self.state);
            let subscriber_id = state.next_subscriber;
            state.next_subscriber += 1;
            state
                .map_subscribers
                .entry(name.clone())
                .or_default()
                .push((subscriber_id, Arc::clone(&subscriber)));
            drop(state);

            let catch_up: Vec<MapChangeEvent> = data
                .map(&name)
                .map(|map| {
                    map.iter()
                        .map(|(key, entry)| MapChangeEvent {
                            key: key.clone(),
                            old_value: serde_json::Value::Null,
                            value: entry.data.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let connection = Arc::clone(self);
            let subscriber = Arc::clone(&subscriber);
            dispatcher.dispatch(move || {
                let slot = [(0u64, subscriber)];
                for event in &catch_up {
                    connection.deliver_map_event(event, &slot);
                }
            });
            subscriber_id
        });

        let weak = Arc::downgrade(self);
        let name_for_removal = name;
        Registration::new(move || {
            if let Some(connection) = weak.upgrade() {
                let mut state = lock(&connection.state);
                if let Some(slots) = state.map_subscribers.get_mut(&name_for_removal) {
                    slots.retain(|(id, _)| *id != subscriber_id);
                }
            }
        })
    }

    /// List counterpart of [`TopicConnection::subscribe_map`].
    pub(crate) fn subscribe_list(
        self: &Arc<Self>,
        name: &str,
        subscriber: ListSubscriber,
    ) -> Registration {
        let dispatcher = self.current_dispatcher();
        let subscriber = Arc::new(Mutex::new(subscriber));
        let name = name.to_string();

        let subscriber_id = self.topic.read(|data| {
            let mut state = lock(&self.state);
            let subscriber_id = state.next_subscriber;
            state.next_subscriber += 1;
            state
                .list_subscribers
                .entry(name.clone())
                .or_default()
                .push((subscriber_id, Arc::clone(&subscriber)));
            drop(state);

            let catch_up: Vec<ListChangeEvent> = data
                .list(&name)
                .map(|list| {
                    list.iter()
                        .map(|(key, entry)| ListChangeEvent {
                            key,
                            kind: ListChangeKind::Insert,
                            old_value: serde_json::Value::Null,
                            value: entry.value.clone(),
                            prev: entry.prev,
                            next: entry.next,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let connection = Arc::clone(self);
            let subscriber = Arc::clone(&subscriber);
            dispatcher.dispatch(move || {
                let slot = [(0u64, subscriber)];
                for event in &catch_up {
                    connection.deliver_list_event(event, &slot);
                }
            });
            subscriber_id
        });

        let weak = Arc::downgrade(self);
        let name_for_removal = name;
        Registration::new(move || {
            if let Some(connection) = weak.upgrade() {
                let mut state = lock(&connection.state);
                if let Some(slots) = state.list_subscribers.get_mut(&name_for_removal) {
                    slots.retain(|(id, _)| *id != subscriber_id);
                }
            }
        })
    }

    /// Submits a conditional change; the completion resolves to whether it
    /// was accepted. A rejected scoped write is untracked again: the entry
    /// it would have owned was never written.
    pub(crate) fn submit_bool(
        self: &Arc<Self>,
        change: ChangeRecord,
        scoped: Option<ScopedKey>,
    ) -> Completion<bool> {
        let dispatcher = self.current_dispatcher();
        let completion = Completion::new(dispatcher, Some(self.pending.begin()));

        let id = EventId::random();
        self.track_scoped(&scoped, id);

        let resolver = completion.clone();
        let connection = Arc::clone(self);
        let scoped_for_result = scoped.clone();
        let outcome = self.topic.submit_prepared(
            id,
            change,
            Some(Box::new(move |result| {
                if !result.is_accepted() {
                    connection.untrack_scoped(&scoped_for_result, id);
                }
                resolver.complete(result.is_accepted());
            })),
        );
        if let Err(error) = outcome {
            self.untrack_scoped(&scoped, id);
            self.failure.report(error.into());
            completion.complete(false);
        }
        completion
    }

    /// Submits an unconditional change; the completion resolves on apply.
    pub(crate) fn submit_void(
        self: &Arc<Self>,
        change: ChangeRecord,
        scoped: Option<ScopedKey>,
    ) -> Completion<()> {
        let dispatcher = self.current_dispatcher();
        let completion = Completion::new(dispatcher, Some(self.pending.begin()));

        let id = EventId::random();
        self.track_scoped(&scoped, id);

        let resolver = completion.clone();
        let connection = Arc::clone(self);
        let scoped_for_result = scoped.clone();
        let outcome = self.topic.submit_prepared(
            id,
            change,
            Some(Box::new(move |result| {
                if !result.is_accepted() {
                    connection.untrack_scoped(&scoped_for_result, id);
                }
                resolver.complete(());
            })),
        );
        if let Err(error) = outcome {
            self.untrack_scoped(&scoped, id);
            self.failure.report(error.into());
            completion.complete(());
        }
        completion
    }

    fn track_scoped(&self, scoped: &Option<ScopedKey>, id: EventId) {
        let Some(scoped) = scoped else { return };
        let mut state = lock(&self.state);
        match scoped {
            ScopedKey::Map(name, key) => {
                state.scoped_map.insert((name.clone(), key.clone()), id);
            }
            ScopedKey::List(name, key) => {
                state.scoped_list.insert((name.clone(), *key), id);
            }
        }
    }

    /// Drops the tracking entry for a write that never landed. Guarded on
    /// the revision: a newer write to the same key keeps its own tracking.
    fn untrack_scoped(&self, scoped: &Option<ScopedKey>, id: EventId) {
        let Some(scoped) = scoped else { return };
        let mut state = lock(&self.state);
        match scoped {
            ScopedKey::Map(name, key) => {
                let entry = (name.clone(), key.clone());
                if state.scoped_map.get(&entry) == Some(&id) {
                    state.scoped_map.remove(&entry);
                }
            }
            ScopedKey::List(name, key) => {
                let entry = (name.clone(), *key);
                if state.scoped_list.get(&entry) == Some(&id) {
                    state.scoped_list.remove(&entry);
                }
            }
        }
    }
}

impl std::fmt::Debug for TopicConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicConnection")
            .field("topic_id", &self.topic.id())
            .field("user", &self.user.id)
            .field("active", &self.is_active())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
