//! Worker pool and per-consumer serial dispatch.
//!
//! The engine owns (or borrows) one [`Executor`], a fixed-size rayon pool.
//! Each connection context layers an [`ActionDispatcher`] on top: an
//! unbounded FIFO queue drained by at most one pool worker at a time, so
//! event delivery and future completions are serialized per consumer while
//! different consumers proceed in parallel.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;
use thiserror::Error;

/// One queued unit of work.
pub type Action = Box<dyn FnOnce() + Send>;

/// Error building the worker pool.
#[derive(Debug, Error)]
#[error("failed to build worker pool: {0}")]
pub struct ExecutorBuildError(String);

/// Fixed-size worker pool executing dispatched actions.
pub struct Executor {
    pool: rayon::ThreadPool,
}

impl Executor {
    /// Builds a pool with the given number of worker threads.
    pub fn new(threads: usize) -> Result<Self, ExecutorBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("covalent-worker-{index}"))
            .build()
            .map_err(|error| ExecutorBuildError(error.to_string()))?;
        Ok(Self { pool })
    }

    /// Builds a pool sized to the machine's CPU count.
    pub fn with_default_size() -> Result<Self, ExecutorBuildError> {
        Self::new(
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4),
        )
    }

    /// Schedules a task on the pool.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.pool.spawn(task);
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

struct DispatchQueue {
    pending: SegQueue<Action>,
    /// True while some pool worker owns the drain; enforces one-at-a-time,
    /// FIFO execution.
    scheduled: AtomicBool,
    executor: Arc<Executor>,
}

impl DispatchQueue {
    fn drain(self: &Arc<Self>) {
        loop {
            while let Some(action) = self.pending.pop() {
                // A panicking action must not take the pool down (rayon
                // aborts on escaping panics) nor stall the queue.
                if let Err(panic) = catch_unwind(AssertUnwindSafe(action)) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(%message, "dispatched action panicked");
                }
            }
            self.scheduled.store(false, Ordering::Release);
            // An action enqueued between the final pop and the store above
            // may have lost the scheduling race; reclaim it if so.
            if self.pending.is_empty() || self.scheduled.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

/// Per-consumer FIFO executor handle.
///
/// `dispatch` enqueues; actions run one at a time, in order, on the shared
/// pool. Clones share the same queue.
#[derive(Clone)]
pub struct ActionDispatcher {
    queue: Arc<DispatchQueue>,
}

impl ActionDispatcher {
    /// Creates a dispatcher draining onto the given executor.
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            queue: Arc::new(DispatchQueue {
                pending: SegQueue::new(),
                scheduled: AtomicBool::new(false),
                executor,
            }),
        }
    }

    /// Enqueues an action for serialized execution.
    pub fn dispatch(&self, action: impl FnOnce() + Send + 'static) {
        self.queue.pending.push(Box::new(action));
        if !self.queue.scheduled.swap(true, Ordering::AcqRel) {
            let queue = Arc::clone(&self.queue);
            self.queue.executor.spawn(move || queue.drain());
        }
    }
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("pending", &self.queue.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn actions_run_in_dispatch_order() {
        let executor = Arc::new(Executor::new(4).expect("pool"));
        let dispatcher = ActionDispatcher::new(executor);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let sink = Arc::clone(&seen);
            dispatcher.dispatch(move || sink.lock().unwrap().push(i));
        }

        wait_for(|| seen.lock().unwrap().len() == 100);
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_action_does_not_stall_the_queue() {
        let executor = Arc::new(Executor::new(2).expect("pool"));
        let dispatcher = ActionDispatcher::new(executor);

        let seen = Arc::new(Mutex::new(0));
        dispatcher.dispatch(|| panic!("broken action"));
        let sink = Arc::clone(&seen);
        dispatcher.dispatch(move || *sink.lock().unwrap() += 1);

        wait_for(|| *seen.lock().unwrap() == 1);
    }

    #[test]
    fn dispatchers_on_one_pool_are_independent() {
        let executor = Arc::new(Executor::new(2).expect("pool"));
        let first = ActionDispatcher::new(Arc::clone(&executor));
        let second = ActionDispatcher::new(executor);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        first.dispatch(move || sink.lock().unwrap().push("first"));
        let sink = Arc::clone(&seen);
        second.dispatch(move || sink.lock().unwrap().push("second"));

        wait_for(|| seen.lock().unwrap().len() == 2);
    }
}
