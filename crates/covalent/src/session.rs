//! Session-scoped teardown (the beacon path).
//!
//! Browser clients fire a beacon when their session ends; the integration
//! layer maps that to [`Session::close`], which tears down every
//! attach-driven context registered under the session, exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::AttachConnectionContext;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionInner {
    contexts: Vec<Weak<AttachConnectionContext>>,
    closed: bool,
}

/// One client session's registry of attach contexts.
pub struct Session {
    id: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(SessionInner {
                contexts: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registers a context for teardown when the session ends.
    ///
    /// Registering on an already-closed session closes the context
    /// immediately.
    pub fn register(&self, context: &Arc<AttachConnectionContext>) {
        let closed = {
            let mut inner = lock(&self.inner);
            if !inner.closed {
                inner.contexts.push(Arc::downgrade(context));
            }
            inner.closed
        };
        if closed {
            context.close();
        }
    }

    /// The beacon handler: closes every registered context. Idempotent.
    pub fn close(&self) {
        let contexts = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.contexts)
        };
        tracing::debug!(session_id = %self.id, contexts = contexts.len(), "session closed");
        for context in contexts {
            if let Some(context) = context.upgrade() {
                context.close();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_a_session_closes_registered_contexts() {
        let session = Session::new("http-session-1");
        let context = Arc::new(AttachConnectionContext::new());
        session.register(&context);

        context.attach("widget-1");
        assert!(context.is_active());

        session.close();
        session.close(); // idempotent

        assert!(!context.is_active());
        assert!(session.is_closed());
    }

    #[test]
    fn registering_on_a_closed_session_closes_immediately() {
        let session = Session::new("http-session-2");
        session.close();

        let context = Arc::new(AttachConnectionContext::new());
        session.register(&context);

        // A closed context rejects further attachments.
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            context.attach("late");
        }));
        assert!(panicked.is_err());
    }
}
