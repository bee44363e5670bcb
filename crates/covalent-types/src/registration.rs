//! Removable registrations.
//!
//! Every subscription-like resource in Covalent (event-log subscriptions,
//! topic change subscribers, connection contexts) hands back a
//! [`Registration`]; dropping it does nothing, calling [`Registration::remove`]
//! tears the resource down exactly once.

use std::sync::Mutex;

type Remover = Box<dyn FnOnce() + Send>;

/// Handle to an active registration. `remove` is idempotent.
pub struct Registration {
    remover: Mutex<Option<Remover>>,
}

impl Registration {
    /// Wraps a teardown closure. The closure runs at most once.
    pub fn new(remover: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remover: Mutex::new(Some(Box::new(remover))),
        }
    }

    /// A registration that is already spent; `remove` is a no-op.
    ///
    /// Returned from operations that fail upfront, e.g. opening a connection
    /// on an engine that has been shut down.
    pub fn inert() -> Self {
        Self {
            remover: Mutex::new(None),
        }
    }

    /// Removes the underlying resource. Calling this a second time has no
    /// effect.
    pub fn remove(&self) {
        let remover = self
            .remover
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(remover) = remover {
            remover();
        }
    }

    /// Returns true if `remove` has already run (or the registration was
    /// created inert).
    pub fn is_removed(&self) -> bool {
        self.remover
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("removed", &self.is_removed())
            .finish()
    }
}
