//! # covalent-types: Core types for Covalent
//!
//! This crate contains shared types used across the Covalent system:
//! - Entity IDs ([`NodeId`], [`EventId`], [`ListKey`])
//! - Entry visibility ([`EntryScope`])
//! - User identity ([`UserInfo`])
//! - Removable registrations ([`Registration`])
//! - ISO-8601 duration serialization ([`duration`])
//! - JSON value helpers ([`value`])

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod duration;
pub mod registration;
pub mod value;

pub use registration::Registration;
pub use value::{ValueError, from_json_value, to_json_value};

// ============================================================================
// Entity IDs - All Copy (cheap 16-byte values)
// ============================================================================

/// Unique identifier for a backend node.
///
/// Every backend instance gets one random node ID for its lifetime. The ID
/// participates in membership, leadership and scoped-entry ownership.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a fresh random node ID.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NodeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Identifier of one change record in a topic's event log.
///
/// The event ID doubles as the tracking ID for result delivery and as the
/// revision ID of any entry the record writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Allocates a fresh tracking ID for a new change record.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Stable key of one entry in a named list.
///
/// Unlike the revision ID, the list key never changes for the lifetime of
/// the entry, across value rewrites and moves.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ListKey(Uuid);

impl ListKey {
    /// Allocates a fresh key for a newly inserted list entry.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for ListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ListKey {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

// ============================================================================
// Entry Scope
// ============================================================================

/// Visibility and lifetime of a map or list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryScope {
    /// The entry persists until explicitly removed or expired.
    #[default]
    Topic,
    /// The entry is removed automatically when the connection that wrote it
    /// deactivates, or when its owning node leaves the cluster.
    Connection,
}

// ============================================================================
// User Identity
// ============================================================================

/// Sentinel for "no explicit color index assigned".
pub const UNASSIGNED_COLOR_INDEX: i32 = -1;

/// Identity of the end user behind a topic connection.
///
/// Only `id` matters for coordination; the remaining fields are display
/// metadata carried through to presence-style consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Explicit color index, or [`UNASSIGNED_COLOR_INDEX`] to let the engine
    /// assign one.
    #[serde(default = "unassigned_color")]
    pub color_index: i32,
}

fn unassigned_color() -> i32 {
    UNASSIGNED_COLOR_INDEX
}

impl UserInfo {
    /// Creates a user with the given ID and no display metadata.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            abbreviation: None,
            image: None,
            color_index: UNASSIGNED_COLOR_INDEX,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_abbreviation(mut self, abbreviation: impl Into<String>) -> Self {
        self.abbreviation = Some(abbreviation.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_color_index(mut self, color_index: i32) -> Self {
        self.color_index = color_index;
        self
    }

    /// Returns true if the user carries an explicit color index.
    pub fn has_color_index(&self) -> bool {
        self.color_index != UNASSIGNED_COLOR_INDEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_as_canonical_uuid_strings() {
        let node = NodeId::random();
        let json = serde_json::to_string(&node).expect("serialize");
        assert_eq!(json, format!("\"{node}\""));

        let back: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, node);
    }

    #[test]
    fn distinct_random_ids() {
        assert_ne!(EventId::random(), EventId::random());
        assert_ne!(ListKey::random(), ListKey::random());
    }

    #[test]
    fn scope_defaults_to_topic() {
        assert_eq!(EntryScope::default(), EntryScope::Topic);
    }

    #[test]
    fn scope_serializes_uppercase() {
        let json = serde_json::to_string(&EntryScope::Connection).expect("serialize");
        assert_eq!(json, "\"CONNECTION\"");
    }

    #[test]
    fn user_info_builder() {
        let user = UserInfo::new("steve")
            .with_name("Steve")
            .with_abbreviation("SA")
            .with_color_index(3);

        assert_eq!(user.id, "steve");
        assert_eq!(user.name.as_deref(), Some("Steve"));
        assert_eq!(user.abbreviation.as_deref(), Some("SA"));
        assert!(user.has_color_index());
        assert_eq!(user.color_index, 3);
    }

    #[test]
    fn user_info_color_defaults_to_unassigned() {
        let user: UserInfo = serde_json::from_str(r#"{"id":"x"}"#).expect("deserialize");
        assert!(!user.has_color_index());
    }
}
