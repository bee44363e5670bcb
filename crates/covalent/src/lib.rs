//! # Covalent
//!
//! Topic-based coordination fabric: shared maps and lists over a
//! totally-ordered event log, with real-time change notification and
//! optional cluster distribution.
//!
//! Clients open a *connection* against a named *topic*; while active, the
//! connection exposes named maps and named lists whose every mutation is
//! serialized into the topic's event log and fanned out to all
//! co-subscribers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Engine                             │
//! │  ┌─────────┐   ┌──────────────┐   ┌───────────────────────┐  │
//! │  │ Backend │ → │    Topic     │ → │   TopicConnection     │  │
//! │  │  (log)  │   │ (fold + fan) │   │ (maps/lists/futures)  │  │
//! │  └─────────┘   └──────────────┘   └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use covalent::{Engine, LocalBackend, SystemConnectionContext, UserInfo};
//!
//! let engine = Engine::new(Arc::new(LocalBackend::new()))?;
//! let context = engine.system_context();
//!
//! let handle = engine.open_topic_connection(
//!     context.as_ref(),
//!     "form/proposal-42",
//!     UserInfo::new("steve"),
//!     |connection| {
//!         let map = connection.named_map("fields");
//!         map.put("title", "Draft");
//!         map.subscribe(|event| println!("{} -> {}", event.key, event.value));
//!     },
//! );
//! // ... later
//! handle.remove();
//! engine.close();
//! ```

mod completion;
mod connection;
mod context;
mod engine;
mod error;
mod executor;
mod list;
mod map;
mod session;

// Facade surface
pub use completion::Completion;
pub use connection::{ActivationCallback, TopicConnection};
pub use context::{
    ActivationHandler, AttachConnectionContext, ConnectionContext, SystemConnectionContext,
};
pub use engine::{ConnectionHandle, Engine, USER_COLOR_COUNT};
pub use error::EngineError;
pub use executor::{ActionDispatcher, Executor, ExecutorBuildError};
pub use list::{ListChangeEvent, ListInsertion, SharedList};
pub use map::{MapChangeEvent, SharedMap};
pub use session::Session;

// Re-export core types
pub use covalent_types::{
    EntryScope, EventId, ListKey, NodeId, Registration, UNASSIGNED_COLOR_INDEX, UserInfo,
    ValueError, from_json_value, to_json_value,
};

// Re-export the backend SPI and the in-process substrate
pub use covalent_backend::{Backend, BackendError, EventLog, LocalBackend, LogHub, MembershipEvent};

// Re-export topic-level types reachable through the facade
pub use covalent_topic::{
    ChangeDetails, ChangeRecord, ChangeResult, ListChangeKind, Topic, TopicError, TopicSnapshot,
};

// Re-export configuration
pub use covalent_config::{BackendKind, ConfigLoader, CovalentConfig};
