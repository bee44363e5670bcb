//! Completion handles for submitted operations.
//!
//! Every write through a connection returns a [`Completion`]: a one-shot
//! value that resolves when the change round-trips the event log. Callback
//! delivery goes through the connection's [`ActionDispatcher`], so
//! completions and subscriber notifications share one serialized stream
//! per consumer. `wait`/`wait_timeout` exist for code (and tests) that
//! prefers blocking.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::executor::ActionDispatcher;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Callback<T> = Box<dyn FnOnce(T) + Send>;

struct CompletionInner<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

struct CompletionState<T> {
    dispatcher: ActionDispatcher,
    inner: Mutex<CompletionInner<T>>,
    ready: Condvar,
    /// Keeps the engine's in-flight count up while unresolved.
    _pending: Option<PendingGuard>,
}

/// One-shot result of a submitted operation. Clones share the same slot.
pub struct Completion<T> {
    state: Arc<CompletionState<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub(crate) fn new(dispatcher: ActionDispatcher, pending: Option<PendingGuard>) -> Self {
        Self {
            state: Arc::new(CompletionState {
                dispatcher,
                inner: Mutex::new(CompletionInner {
                    value: None,
                    callbacks: Vec::new(),
                }),
                ready: Condvar::new(),
                _pending: pending,
            }),
        }
    }

    /// Registers a callback, dispatched through the owning dispatcher.
    /// Registering after resolution dispatches immediately.
    pub fn on_complete(&self, callback: impl FnOnce(T) + Send + 'static) {
        let mut inner = lock(&self.state.inner);
        match &inner.value {
            Some(value) => {
                let value = value.clone();
                drop(inner);
                self.state.dispatcher.dispatch(move || callback(value));
            }
            None => inner.callbacks.push(Box::new(callback)),
        }
    }

    /// Blocks until the completion resolves.
    pub fn wait(&self) -> T {
        let mut inner = lock(&self.state.inner);
        loop {
            if let Some(value) = &inner.value {
                return value.clone();
            }
            inner = self
                .state
                .ready
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until resolution or the timeout; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = lock(&self.state.inner);
        loop {
            if let Some(value) = &inner.value {
                return Some(value.clone());
            }
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let (guard, _) = self
                .state
                .ready
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// True once the completion has resolved.
    pub fn is_complete(&self) -> bool {
        lock(&self.state.inner).value.is_some()
    }

    /// Resolves the completion, dispatching registered callbacks.
    ///
    /// # Panics
    ///
    /// Panics on double completion; a result tracker fires exactly once.
    pub(crate) fn complete(&self, value: T) {
        let callbacks = {
            let mut inner = lock(&self.state.inner);
            assert!(inner.value.is_none(), "completion resolved twice");
            inner.value = Some(value.clone());
            self.state.ready.notify_all();
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            let value = value.clone();
            self.state.dispatcher.dispatch(move || callback(value));
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &lock(&self.state.inner).value.is_some())
            .finish()
    }
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Count of unresolved completions, used by engine shutdown to linger
/// briefly for in-flight operations.
pub(crate) struct PendingOps {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingOps {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    pub(crate) fn begin(self: &Arc<Self>) -> PendingGuard {
        *lock(&self.count) += 1;
        PendingGuard {
            ops: Arc::clone(self),
        }
    }

    /// Waits until no operations are in flight; `false` on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = lock(&self.count);
        while *count > 0 {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
            else {
                return false;
            };
            let (guard, result) = self
                .idle
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            count = guard;
            if result.timed_out() && *count > 0 {
                return false;
            }
        }
        true
    }
}

pub(crate) struct PendingGuard {
    ops: Arc<PendingOps>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut count = lock(&self.ops.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.ops.idle.notify_all();
        }
    }
}
