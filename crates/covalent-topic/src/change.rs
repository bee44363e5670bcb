//! Change records: the wire form of every topic mutation.
//!
//! A change record is a tagged JSON document submitted to a topic's event
//! log. Applying one is deterministic, so every node folding the same log
//! arrives at the same state. The record's event ID doubles as the new
//! revision ID of any entry the record writes.
//!
//! Conditional fields follow two conventions:
//! - `Option<...>` means "no condition" when `None`;
//! - a JSON `null` *value* is the removal / expect-absent sentinel.

use std::time::Duration;

use covalent_types::{EventId, ListKey, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Asserts that `right` is the immediate successor of `left` in a list.
///
/// `None` stands for the list boundary: `left = None` means `right` must be
/// the head, `right = None` means `left` must be the tail, and both `None`
/// asserts the list is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyCondition {
    pub left: Option<ListKey>,
    pub right: Option<ListKey>,
}

/// One intended mutation of topic state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRecord {
    /// Map put/replace with optional compare-and-set on the prior revision
    /// and/or the prior value. A `null` value removes the key.
    Put {
        name: String,
        key: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_id: Option<EventId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_owner: Option<NodeId>,
    },

    /// Map put comparing only the prior value (`null` = expect absent).
    Replace {
        name: String,
        key: String,
        expected_value: Value,
        value: Value,
    },

    /// List insertion. The stable entry key is allocated by the submitter
    /// so that callers learn it before the change round-trips the log.
    ///
    /// `reference_key = None` targets a list boundary: `before = true`
    /// appends to the tail, `before = false` prepends to the head.
    Insert {
        name: String,
        key: ListKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference_key: Option<ListKey>,
        before: bool,
        item: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        conditions: Vec<AdjacencyCondition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_owner: Option<NodeId>,
    },

    /// Reorders an existing entry in front of `reference_key`.
    MoveBefore {
        name: String,
        reference_key: ListKey,
        key_to_move: ListKey,
    },

    /// Reorders an existing entry behind `reference_key`.
    MoveAfter {
        name: String,
        reference_key: ListKey,
        key_to_move: ListKey,
    },

    /// Rewrites the value at a list key (`null` removes the entry), with
    /// optional compare-and-set on the revision.
    ListSet {
        name: String,
        key: ListKey,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_id: Option<EventId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_owner: Option<NodeId>,
    },

    /// Sets or clears (`None`) the idle-expiration timeout of a named map.
    MapTimeout {
        name: String,
        #[serde(default, with = "covalent_types::duration::iso8601::option")]
        value: Option<Duration>,
    },

    /// Sets or clears the idle-expiration timeout of a named list.
    ListTimeout {
        name: String,
        #[serde(default, with = "covalent_types::duration::iso8601::option")]
        value: Option<Duration>,
    },

    /// A backend node announces it has attached to this topic.
    NodeJoin { node_id: NodeId },

    /// A node gained its first active connection on this topic.
    NodeActivate { node_id: NodeId },

    /// A node lost its last active connection on this topic.
    NodeDeactivate { node_id: NodeId },
}

impl ChangeRecord {
    /// The compensating removal for a connection-scoped map entry.
    pub fn compensate_map(name: &str, key: &str, revision: EventId) -> Self {
        ChangeRecord::Put {
            name: name.to_string(),
            key: key.to_string(),
            value: Value::Null,
            expected_id: Some(revision),
            expected_value: None,
            scope_owner: None,
        }
    }

    /// The compensating removal for a connection-scoped list entry.
    pub fn compensate_list(name: &str, key: ListKey, revision: EventId) -> Self {
        ChangeRecord::ListSet {
            name: name.to_string(),
            key,
            value: Value::Null,
            expected_id: Some(revision),
            scope_owner: None,
        }
    }
}

/// Verdict of applying one change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeResult {
    /// Preconditions held; state changed (or the change was non-mutating).
    Accepted,
    /// A precondition failed; state is untouched.
    Rejected,
}

impl ChangeResult {
    pub fn is_accepted(self) -> bool {
        matches!(self, ChangeResult::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_tag_with_screaming_snake_case() {
        let change = ChangeRecord::MoveBefore {
            name: "tasks".into(),
            reference_key: ListKey::random(),
            key_to_move: ListKey::random(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["type"], "MOVE_BEFORE");
    }

    #[test]
    fn put_round_trips_with_conditions() {
        let change = ChangeRecord::Put {
            name: "form".into(),
            key: "title".into(),
            value: serde_json::json!("draft"),
            expected_id: Some(EventId::random()),
            expected_value: Some(Value::Null),
            scope_owner: Some(NodeId::random()),
        };
        let json = serde_json::to_value(&change).unwrap();
        let back: ChangeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn absent_conditions_are_omitted_from_the_wire_form() {
        let change = ChangeRecord::Put {
            name: "form".into(),
            key: "title".into(),
            value: serde_json::json!(1),
            expected_id: None,
            expected_value: None,
            scope_owner: None,
        };
        let json = serde_json::to_value(&change).unwrap();
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("expected_id"));
        assert!(!object.contains_key("scope_owner"));
    }

    #[test]
    fn timeout_serializes_as_iso8601() {
        let change = ChangeRecord::ListTimeout {
            name: "chat".into(),
            value: Some(Duration::from_secs(60)),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["value"], "PT1M");

        let back: ChangeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }
}
