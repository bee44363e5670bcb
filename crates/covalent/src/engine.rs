//! The process-wide engine facade.
//!
//! One [`Engine`] owns the backend, the worker pool, the topic registry
//! and the set of open connections. Integration code opens connections
//! through it; everything else (topic runtime, contexts, dispatch) hangs
//! off the pieces it wires together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use covalent_backend::{Backend, LocalBackend};
use covalent_config::{BackendKind, CovalentConfig};
use covalent_topic::{ChangeRecord, Topic};
use covalent_types::{Registration, UserInfo};
use indexmap::IndexMap;

use crate::completion::PendingOps;
use crate::connection::{FailureCell, TopicConnection, TopicActivationHandler};
use crate::context::{ConnectionContext, SystemConnectionContext};
use crate::error::EngineError;
use crate::executor::Executor;

/// Number of distinct presence colors cycled across users.
pub const USER_COLOR_COUNT: usize = 7;

/// How long shutdown lingers for in-flight operations.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one open topic connection.
///
/// `remove` deactivates the connection and forgets it; backend failures
/// surface through [`ConnectionHandle::on_connection_failed`].
pub struct ConnectionHandle {
    registration: Registration,
    failure: Arc<FailureCell>,
}

impl ConnectionHandle {
    /// Deactivates and unregisters the connection. Idempotent.
    pub fn remove(&self) {
        self.registration.remove();
    }

    pub fn is_removed(&self) -> bool {
        self.registration.is_removed()
    }

    /// Registers a one-shot callback for backend failures on this
    /// connection. Fires immediately when a failure already happened.
    pub fn on_connection_failed(&self, handler: impl FnOnce(&EngineError) + Send + 'static) {
        self.failure.on_failure(Box::new(move |error| handler(&error)));
    }
}

struct EngineInner {
    backend: Arc<dyn Backend>,
    executor: Arc<Executor>,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    /// First-seen order of user IDs drives local color assignment.
    user_colors: Mutex<IndexMap<String, usize>>,
    /// Active connections per topic; edges drive NODE_ACTIVATE/DEACTIVATE.
    active_counts: Mutex<HashMap<String, usize>>,
    connections: Mutex<HashMap<u64, Arc<TopicConnection>>>,
    next_connection: AtomicU64,
    pending: Arc<PendingOps>,
    active: AtomicBool,
    system_context: Arc<SystemConnectionContext>,
}

/// The engine: backend + executor + topic registry + open connections.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Builds an engine owning a worker pool sized to the CPU count.
    pub fn new(backend: Arc<dyn Backend>) -> Result<Self, EngineError> {
        let executor = Arc::new(Executor::with_default_size()?);
        Ok(Self::assemble(backend, executor))
    }

    /// Builds an engine on an externally supplied worker pool.
    pub fn with_executor(backend: Arc<dyn Backend>, executor: Arc<Executor>) -> Self {
        Self::assemble(backend, executor)
    }

    /// Builds an engine from loaded configuration.
    pub fn from_config(config: &CovalentConfig) -> Result<Self, EngineError> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Local => Arc::new(LocalBackend::new()),
            BackendKind::Cluster => {
                return Err(EngineError::UnsupportedBackend("cluster".to_string()));
            }
        };
        if let Some(data_dir) = &config.data_dir {
            // The in-process backend keeps no files; the directory is
            // honored by persistent backends.
            tracing::debug!(data_dir = %data_dir.display(), "data directory configured");
        }
        let executor = Arc::new(match config.executor_threads {
            Some(threads) => Executor::new(threads)?,
            None => Executor::with_default_size()?,
        });
        Ok(Self::assemble(backend, executor))
    }

    fn assemble(backend: Arc<dyn Backend>, executor: Arc<Executor>) -> Self {
        tracing::debug!(node_id = %backend.node_id(), shared = backend.is_shared(), "engine starting");
        Self {
            inner: Arc::new(EngineInner {
                backend,
                executor,
                topics: Mutex::new(HashMap::new()),
                user_colors: Mutex::new(IndexMap::new()),
                active_counts: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(0),
                pending: PendingOps::new(),
                active: AtomicBool::new(true),
                system_context: Arc::new(SystemConnectionContext::new()),
            }),
        }
    }

    /// The built-in context for service-level consumers.
    pub fn system_context(&self) -> Arc<SystemConnectionContext> {
        Arc::clone(&self.inner.system_context)
    }

    /// The engine's worker pool.
    pub fn executor(&self) -> Arc<Executor> {
        Arc::clone(&self.inner.executor)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Opens a connection onto `topic_id`, bound to the given context.
    ///
    /// `on_activation` runs on every activation with the live connection;
    /// consumers register their subscriptions inside it (they are cleared
    /// again on deactivation). An inactive engine returns a handle whose
    /// failure callback fires immediately.
    ///
    /// # Panics
    ///
    /// Panics on an empty topic or user ID.
    pub fn open_topic_connection(
        &self,
        context: &dyn ConnectionContext,
        topic_id: &str,
        user: UserInfo,
        on_activation: impl FnMut(&Arc<TopicConnection>) + Send + 'static,
    ) -> ConnectionHandle {
        assert!(!topic_id.is_empty(), "topic id must not be empty");
        assert!(!user.id.is_empty(), "user id must not be empty");

        let failure = FailureCell::new();
        if !self.is_active() {
            failure.report(EngineError::Inactive);
            return ConnectionHandle {
                registration: Registration::inert(),
                failure,
            };
        }

        let topic = {
            let mut topics = lock(&self.inner.topics);
            match topics.get(topic_id) {
                Some(topic) => Arc::clone(topic),
                None => match Topic::open(topic_id, Arc::clone(&self.inner.backend)) {
                    Ok(topic) => {
                        topics.insert(topic_id.to_string(), Arc::clone(&topic));
                        topic
                    }
                    Err(error) => {
                        tracing::warn!(topic_id, %error, "topic open failed");
                        failure.report(error.into());
                        return ConnectionHandle {
                            registration: Registration::inert(),
                            failure,
                        };
                    }
                },
            }
        };

        let connection = TopicConnection::new(
            topic,
            user,
            Arc::clone(&self.inner.pending),
            self.activation_hook(topic_id),
            Box::new(on_activation),
            Arc::clone(&failure),
        );

        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.connections).insert(connection_id, Arc::clone(&connection));

        let handler_connection = Arc::clone(&connection);
        let context_registration = context.init(
            Box::new(move |dispatcher| handler_connection.accept_dispatcher(dispatcher)),
            &self.inner.executor,
        );

        let engine = Arc::downgrade(&self.inner);
        ConnectionHandle {
            registration: Registration::new(move || {
                context_registration.remove();
                connection.close();
                if let Some(engine) = engine.upgrade() {
                    lock(&engine.connections).remove(&connection_id);
                }
            }),
            failure,
        }
    }

    /// Builds the per-connection hook translating activation edges into
    /// NODE_ACTIVATE / NODE_DEACTIVATE changes (on the 0↔1 transitions of
    /// the topic's local connection count).
    fn activation_hook(&self, topic_id: &str) -> TopicActivationHandler {
        let engine = Arc::downgrade(&self.inner);
        let topic_id = topic_id.to_string();
        Box::new(move |active| {
            let Some(engine) = engine.upgrade() else { return };
            let edge = {
                let mut counts = lock(&engine.active_counts);
                let count = counts.entry(topic_id.clone()).or_insert(0);
                if active {
                    *count += 1;
                    *count == 1
                } else {
                    let was = *count;
                    *count = count.saturating_sub(1);
                    was == 1
                }
            };
            if !edge {
                return;
            }

            let topic = lock(&engine.topics).get(&topic_id).cloned();
            let Some(topic) = topic else { return };
            let node_id = topic.local_node();
            let change = if active {
                ChangeRecord::NodeActivate { node_id }
            } else {
                ChangeRecord::NodeDeactivate { node_id }
            };
            if let Err(error) = topic.submit(change) {
                tracing::warn!(%topic_id, %error, "node activation change failed");
            }
        })
    }

    /// The presence color index for a user.
    ///
    /// An explicit `color_index` wins. Otherwise, a standalone backend
    /// cycles colors in first-seen order; a shared backend derives the
    /// index from a stable hash of the user ID so that every node agrees
    /// without coordination.
    pub fn user_color_index(&self, user: &UserInfo) -> usize {
        if user.has_color_index() && user.color_index >= 0 {
            return usize::try_from(user.color_index).expect("checked non-negative");
        }

        if self.inner.backend.is_shared() {
            let digest = blake3::hash(user.id.as_bytes());
            let bytes: [u8; 8] = digest.as_bytes()[..8]
                .try_into()
                .expect("blake3 digests carry 32 bytes");
            return (u64::from_le_bytes(bytes) % USER_COLOR_COUNT as u64) as usize;
        }

        let mut colors = lock(&self.inner.user_colors);
        if let Some(index) = colors.get(&user.id) {
            return *index;
        }
        let index = colors.len() % USER_COLOR_COUNT;
        colors.insert(user.id.clone(), index);
        index
    }

    /// Shuts the engine down: stops accepting connections, deactivates
    /// every open one, lingers briefly for in-flight operations and drops
    /// the topic registry. The owned worker pool terminates once its last
    /// reference is gone.
    pub fn close(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("engine shutting down");

        let connections: Vec<_> = lock(&self.inner.connections).drain().collect();
        for (_, connection) in connections {
            connection.close();
        }
        self.inner.system_context.destroy();

        if !self.inner.pending.wait_idle(SHUTDOWN_GRACE) {
            tracing::warn!("shutdown proceeded with operations still in flight");
        }

        lock(&self.inner.topics).clear();
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Close is idempotent; a dropped engine that was never closed
        // explicitly still deactivates cleanly.
        self.active.store(false, Ordering::SeqCst);
    }
}
