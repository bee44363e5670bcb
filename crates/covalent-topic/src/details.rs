//! Applied-change descriptions handed to subscribers.
//!
//! Where [`crate::change::ChangeRecord`] describes an *intended* mutation,
//! these types describe what actually happened, resolved against the state
//! the change was applied to (old values, final neighbors).

use covalent_types::ListKey;
use serde_json::Value;

/// What one accepted change did to a named collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDetails {
    Map(MapChange),
    List(ListChange),
}

/// An applied change to one key of a named map.
///
/// JSON `null` stands for absence on either side: `old_value = null` is an
/// insert, `new_value = null` a removal.
#[derive(Debug, Clone, PartialEq)]
pub struct MapChange {
    pub name: String,
    pub key: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// The kind of an applied list change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangeKind {
    Insert,
    Set,
    Move,
    Remove,
}

/// An applied change to one entry of a named list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListChange {
    pub name: String,
    pub key: ListKey,
    pub kind: ListChangeKind,
    /// Value before the change; `null` for an insert.
    pub old_value: Value,
    /// Value after the change; `null` for a removal.
    pub value: Value,
    /// Neighbors after the change; both `None` for a removal.
    pub prev: Option<ListKey>,
    pub next: Option<ListKey>,
}

impl ChangeDetails {
    /// The collection this change touched.
    pub fn collection_name(&self) -> &str {
        match self {
            ChangeDetails::Map(change) => &change.name,
            ChangeDetails::List(change) => &change.name,
        }
    }
}
