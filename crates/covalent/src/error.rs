//! Engine error types.

use covalent_topic::TopicError;
use thiserror::Error;

/// Errors surfaced through the engine and its connection handles.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has been shut down; no new connections are accepted.
    #[error("engine is not active")]
    Inactive,

    /// The configured backend kind has no implementation in this build.
    #[error("unsupported backend kind {0:?}")]
    UnsupportedBackend(String),

    /// The worker pool could not be built.
    #[error(transparent)]
    Executor(#[from] crate::executor::ExecutorBuildError),

    /// A topic-level failure (event log, snapshot store).
    #[error(transparent)]
    Topic(#[from] TopicError),
}
