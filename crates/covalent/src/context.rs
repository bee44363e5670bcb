//! Connection contexts: who decides when a connection is active, and on
//! which serialized queue its callbacks run.
//!
//! A context calls the activation handler with `Some(dispatcher)` when the
//! consumer becomes active and `None` when it deactivates. Two built-in
//! variants:
//!
//! - [`SystemConnectionContext`]: active immediately and permanently
//!   until the owning service shuts down. Every `init` gets its own
//!   dispatcher, so delivery is serialized per consumer but parallel
//!   across consumers.
//! - [`AttachConnectionContext`]: active while at least one client-side
//!   attachment (a UI widget, a websocket, a tab) is present. All
//!   consumers of one context share its serial queue, the equivalent of a
//!   UI's access queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use covalent_types::Registration;

use crate::executor::{ActionDispatcher, Executor};

/// Receives `Some(dispatcher)` on activation, `None` on deactivation.
pub type ActivationHandler = Box<dyn FnMut(Option<ActionDispatcher>) + Send>;

/// The activation/dispatch contract a connection binds to.
pub trait ConnectionContext: Send + Sync {
    /// Registers a consumer. The handler is invoked on every activation
    /// edge until the returned registration is removed; removal implies a
    /// final deactivation, after which no callbacks fire.
    fn init(&self, handler: ActivationHandler, executor: &Arc<Executor>) -> Registration;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// SystemConnectionContext
// ============================================================================

struct SystemSlot {
    handler: ActivationHandler,
}

struct SystemInner {
    slots: HashMap<u64, SystemSlot>,
    next_slot: u64,
    destroyed: bool,
}

/// Context for service-level consumers: active from `init` until
/// [`SystemConnectionContext::destroy`].
pub struct SystemConnectionContext {
    inner: Arc<Mutex<SystemInner>>,
}

impl SystemConnectionContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SystemInner {
                slots: HashMap::new(),
                next_slot: 0,
                destroyed: false,
            })),
        }
    }

    /// Deactivates every registered consumer. Idempotent; called by the
    /// engine when the owning service shuts down.
    pub fn destroy(&self) {
        let mut inner = lock(&self.inner);
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        let mut slots = std::mem::take(&mut inner.slots);
        drop(inner);
        for slot in slots.values_mut() {
            (slot.handler)(None);
        }
    }
}

impl Default for SystemConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionContext for SystemConnectionContext {
    fn init(&self, mut handler: ActivationHandler, executor: &Arc<Executor>) -> Registration {
        let slot_id = {
            let mut inner = lock(&self.inner);
            assert!(!inner.destroyed, "context already destroyed");

            // One dispatcher per consumer: serialized per consumer,
            // parallel across consumers. Active immediately.
            let dispatcher = ActionDispatcher::new(Arc::clone(executor));
            handler(Some(dispatcher));

            let slot_id = inner.next_slot;
            inner.next_slot += 1;
            inner.slots.insert(slot_id, SystemSlot { handler });
            slot_id
        };

        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                let slot = lock(&inner).slots.remove(&slot_id);
                if let Some(mut slot) = slot {
                    (slot.handler)(None);
                }
            }
        })
    }
}

// ============================================================================
// AttachConnectionContext
// ============================================================================

struct AttachSlot {
    handler: ActivationHandler,
}

struct AttachInner {
    attachments: HashSet<String>,
    slots: HashMap<u64, AttachSlot>,
    next_slot: u64,
    dispatcher: Option<ActionDispatcher>,
    active: bool,
    closed: bool,
}

/// Context whose activation follows client-side attachments.
///
/// Integration code reports attach/detach of whatever concrete handles it
/// manages (widgets, sockets, tabs); the context is active while at least
/// one is attached. A [`crate::session::Session`] can close the whole
/// context when the client's session ends (the beacon path).
pub struct AttachConnectionContext {
    inner: Arc<Mutex<AttachInner>>,
}

impl AttachConnectionContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AttachInner {
                attachments: HashSet::new(),
                slots: HashMap::new(),
                next_slot: 0,
                dispatcher: None,
                active: false,
                closed: false,
            })),
        }
    }

    /// Reports that a client-side handle attached. The first attachment
    /// activates the context. Re-attaching a known handle is a no-op.
    pub fn attach(&self, attachment_id: impl Into<String>) {
        let mut inner = lock(&self.inner);
        assert!(!inner.closed, "context already closed");
        if !inner.attachments.insert(attachment_id.into()) {
            return;
        }
        if !inner.active && inner.attachments.len() == 1 {
            inner.active = true;
            Self::notify_all(&mut inner, true);
        }
    }

    /// Reports that a client-side handle detached. Losing the last
    /// attachment deactivates the context. Unknown handles are ignored.
    pub fn detach(&self, attachment_id: &str) {
        let mut inner = lock(&self.inner);
        if !inner.attachments.remove(attachment_id) {
            return;
        }
        if inner.active && inner.attachments.is_empty() {
            inner.active = false;
            Self::notify_all(&mut inner, false);
        }
    }

    /// Permanently tears the context down, deactivating all consumers.
    /// Idempotent; triggered by session close or explicit teardown.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.attachments.clear();
        if std::mem::replace(&mut inner.active, false) {
            Self::notify_all(&mut inner, false);
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).active
    }

    /// Pushes the current activation state to every consumer.
    ///
    /// Handlers run under the context lock; they only flag intent and
    /// enqueue dispatches, never re-enter the context.
    fn notify_all(inner: &mut AttachInner, active: bool) {
        let dispatcher = inner.dispatcher.clone();
        if active && dispatcher.is_none() {
            // No consumer has registered yet; each init observes the
            // active state and activates itself.
            return;
        }
        let argument = if active { dispatcher } else { None };
        for slot in inner.slots.values_mut() {
            (slot.handler)(argument.clone());
        }
    }
}

impl Default for AttachConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionContext for AttachConnectionContext {
    fn init(&self, mut handler: ActivationHandler, executor: &Arc<Executor>) -> Registration {
        let slot_id = {
            let mut inner = lock(&self.inner);
            assert!(!inner.closed, "context already closed");
            if inner.dispatcher.is_none() {
                // All consumers of one context share its serial queue.
                inner.dispatcher = Some(ActionDispatcher::new(Arc::clone(executor)));
            }
            let slot_id = inner.next_slot;
            inner.next_slot += 1;

            if inner.active {
                let dispatcher = inner.dispatcher.clone();
                handler(dispatcher);
            }
            inner.slots.insert(slot_id, AttachSlot { handler });
            slot_id
        };

        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                let (slot, was_active) = {
                    let mut inner = lock(&inner);
                    (inner.slots.remove(&slot_id), inner.active)
                };
                if let Some(mut slot) = slot {
                    if was_active {
                        (slot.handler)(None);
                    }
                }
            }
        })
    }
}
