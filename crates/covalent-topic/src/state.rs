//! Topic state: named maps, named lists, timeouts and membership.
//!
//! [`TopicData`] is plain data. All mutation goes through
//! [`crate::apply::apply_change`], which keeps every node deterministic;
//! the accessors here expose read-only views and the link-surgery
//! primitives the apply step builds on.
//!
//! Lists are stored as a key-addressed doubly-linked structure
//! (`entries + head + tail`) so that moves rewrite at most four links and
//! removals two, while head-to-tail traversal stays the canonical order
//! for snapshots and subscribe catch-up.

use std::collections::HashMap;
use std::time::Duration;

use covalent_types::{EventId, ListKey, NodeId};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Entries
// ============================================================================

/// One entry of a named map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    /// ID of the change that last wrote this entry.
    pub revision: EventId,
    pub data: Value,
    /// Owning node for connection-scoped entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_owner: Option<NodeId>,
}

/// One entry of a named list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    /// Rewritten by every mutating operation on the entry.
    pub revision: EventId,
    pub value: Value,
    pub prev: Option<ListKey>,
    pub next: Option<ListKey>,
    pub scope_owner: Option<NodeId>,
}

/// Insertion point for a new or moved list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPosition {
    First,
    Last,
    Before(ListKey),
    After(ListKey),
}

// ============================================================================
// ListData
// ============================================================================

/// A named list: key-addressed entries plus head/tail pointers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListData {
    entries: HashMap<ListKey, ListEntry>,
    head: Option<ListKey>,
    tail: Option<ListKey>,
}

impl ListData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<ListKey> {
        self.head
    }

    pub fn tail(&self) -> Option<ListKey> {
        self.tail
    }

    pub fn get(&self, key: ListKey) -> Option<&ListEntry> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: ListKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Iterates entries in list order, head to tail.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter {
            list: self,
            cursor: self.head,
        }
    }

    /// True when `right` immediately follows `left`, with `None` standing
    /// for the respective list boundary.
    pub fn successor_holds(&self, left: Option<ListKey>, right: Option<ListKey>) -> bool {
        match left {
            None => self.head == right,
            Some(left) => match self.entries.get(&left) {
                Some(entry) => entry.next == right,
                None => false,
            },
        }
    }

    /// Links a new entry at the given position.
    ///
    /// Fails (returning `false`, state untouched) when the reference entry
    /// of `Before`/`After` does not exist or `key` is already present.
    pub(crate) fn insert(
        &mut self,
        key: ListKey,
        entry_value: Value,
        revision: EventId,
        scope_owner: Option<NodeId>,
        position: ListPosition,
    ) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        let (prev, next) = match position {
            ListPosition::First => (None, self.head),
            ListPosition::Last => (self.tail, None),
            ListPosition::Before(reference) => match self.entries.get(&reference) {
                Some(entry) => (entry.prev, Some(reference)),
                None => return false,
            },
            ListPosition::After(reference) => match self.entries.get(&reference) {
                Some(entry) => (Some(reference), entry.next),
                None => return false,
            },
        };

        self.entries.insert(
            key,
            ListEntry {
                revision,
                value: entry_value,
                prev,
                next,
                scope_owner,
            },
        );
        self.relink(prev, next, key);
        true
    }

    /// Unlinks and returns an entry, splicing its neighbors together;
    /// `None` if absent.
    pub(crate) fn unlink(&mut self, key: ListKey) -> Option<ListEntry> {
        let entry = self.entries.remove(&key)?;
        if let Some(prev) = entry.prev {
            self.entries.get_mut(&prev).expect("linked entry exists").next = entry.next;
        } else {
            self.head = entry.next;
        }
        if let Some(next) = entry.next {
            self.entries.get_mut(&next).expect("linked entry exists").prev = entry.prev;
        } else {
            self.tail = entry.prev;
        }
        Some(entry)
    }

    /// Moves an existing entry to a new position, stamping `revision`.
    ///
    /// Fails when either key is absent. Moving an entry relative to itself
    /// is an accepted no-op (apart from the revision stamp).
    pub(crate) fn relocate(
        &mut self,
        key_to_move: ListKey,
        revision: EventId,
        position: ListPosition,
    ) -> bool {
        let reference = match position {
            ListPosition::Before(r) | ListPosition::After(r) => Some(r),
            _ => None,
        };
        if !self.entries.contains_key(&key_to_move) {
            return false;
        }
        if let Some(reference) = reference {
            if !self.entries.contains_key(&reference) {
                return false;
            }
            if reference == key_to_move {
                let entry = self.entries.get_mut(&key_to_move).expect("checked above");
                entry.revision = revision;
                return true;
            }
        }

        let entry = self.unlink(key_to_move).expect("checked above");
        let inserted = self.insert(
            key_to_move,
            entry.value,
            revision,
            entry.scope_owner,
            position,
        );
        debug_assert!(inserted, "re-insert of an unlinked entry cannot fail");
        inserted
    }

    /// Rewrites one entry in place (value/revision/scope).
    pub(crate) fn rewrite(
        &mut self,
        key: ListKey,
        entry_value: Value,
        revision: EventId,
        scope_owner: Option<NodeId>,
    ) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.value = entry_value;
                entry.revision = revision;
                entry.scope_owner = scope_owner;
                true
            }
            None => false,
        }
    }

    /// Splice hook used by `insert`: points the outside neighbors at the
    /// newly linked key.
    fn relink(&mut self, prev: Option<ListKey>, next: Option<ListKey>, key: ListKey) {
        match prev {
            Some(prev) => self.entries.get_mut(&prev).expect("linked entry exists").next = Some(key),
            None => self.head = Some(key),
        }
        match next {
            Some(next) => self.entries.get_mut(&next).expect("linked entry exists").prev = Some(key),
            None => self.tail = Some(key),
        }
    }

    /// Rebuilds a list from entries already in order (snapshot restore).
    pub(crate) fn from_ordered(
        ordered: impl IntoIterator<Item = (ListKey, EventId, Value, Option<NodeId>)>,
    ) -> Self {
        let mut list = ListData::new();
        for (key, revision, value, scope_owner) in ordered {
            let inserted = list.insert(key, value, revision, scope_owner, ListPosition::Last);
            debug_assert!(inserted, "snapshot entries have unique keys");
        }
        list
    }
}

/// Head-to-tail iterator over a list.
pub struct ListIter<'a> {
    list: &'a ListData,
    cursor: Option<ListKey>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = (ListKey, &'a ListEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let entry = self.list.entries.get(&key).expect("chain is consistent");
        self.cursor = entry.next;
        Some((key, entry))
    }
}

// ============================================================================
// TopicData
// ============================================================================

/// The complete materialized state of one topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicData {
    pub(crate) maps: IndexMap<String, IndexMap<String, MapEntry>>,
    pub(crate) lists: IndexMap<String, ListData>,
    pub(crate) map_timeouts: HashMap<String, Duration>,
    pub(crate) list_timeouts: HashMap<String, Duration>,
    /// Nodes with at least one active connection on this topic.
    pub(crate) active_nodes: IndexSet<NodeId>,
    /// Attached backend nodes in join order; the first is the leader.
    pub(crate) backend_nodes: Vec<NodeId>,
    /// Accepted collection mutations applied so far.
    pub(crate) change_count: u64,
}

impl TopicData {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has ever been applied (the only state a snapshot
    /// may be loaded into).
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
            && self.lists.is_empty()
            && self.map_timeouts.is_empty()
            && self.list_timeouts.is_empty()
            && self.active_nodes.is_empty()
            && self.backend_nodes.is_empty()
            && self.change_count == 0
    }

    pub fn map(&self, name: &str) -> Option<&IndexMap<String, MapEntry>> {
        self.maps.get(name)
    }

    pub fn map_entry(&self, name: &str, key: &str) -> Option<&MapEntry> {
        self.maps.get(name)?.get(key)
    }

    pub fn list(&self, name: &str) -> Option<&ListData> {
        self.lists.get(name)
    }

    pub fn map_timeout(&self, name: &str) -> Option<Duration> {
        self.map_timeouts.get(name).copied()
    }

    pub fn list_timeout(&self, name: &str) -> Option<Duration> {
        self.list_timeouts.get(name).copied()
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.active_nodes.iter().copied()
    }

    pub fn backend_nodes(&self) -> &[NodeId] {
        &self.backend_nodes
    }

    /// The node responsible for sweeps, snapshots and idle expiration.
    pub fn leader_node(&self) -> Option<NodeId> {
        self.backend_nodes.first().copied()
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// All connection-scoped entries owned by `owner`, as
    /// `(collection, map key or list key, revision)` triples.
    pub fn scoped_entries_of(&self, owner: NodeId) -> Vec<ScopedEntryRef> {
        let mut found = Vec::new();
        for (name, map) in &self.maps {
            for (key, entry) in map {
                if entry.scope_owner == Some(owner) {
                    found.push(ScopedEntryRef::Map {
                        name: name.clone(),
                        key: key.clone(),
                        revision: entry.revision,
                    });
                }
            }
        }
        for (name, list) in &self.lists {
            for (key, entry) in list.iter() {
                if entry.scope_owner == Some(owner) {
                    found.push(ScopedEntryRef::List {
                        name: name.clone(),
                        key,
                        revision: entry.revision,
                    });
                }
            }
        }
        found
    }

    /// Owners of connection-scoped entries that are not attached backend
    /// nodes (state left behind by a crashed cluster).
    pub fn orphaned_scope_owners(&self) -> Vec<NodeId> {
        let mut owners = IndexSet::new();
        let live = |owner: &NodeId| self.backend_nodes.contains(owner);
        for map in self.maps.values() {
            for entry in map.values() {
                if let Some(owner) = entry.scope_owner {
                    if !live(&owner) {
                        owners.insert(owner);
                    }
                }
            }
        }
        for list in self.lists.values() {
            for (_, entry) in list.iter() {
                if let Some(owner) = entry.scope_owner {
                    if !live(&owner) {
                        owners.insert(owner);
                    }
                }
            }
        }
        owners.into_iter().collect()
    }
}

/// Locator of one connection-scoped entry, with the revision to fence the
/// compensating removal on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopedEntryRef {
    Map {
        name: String,
        key: String,
        revision: EventId,
    },
    List {
        name: String,
        key: ListKey,
        revision: EventId,
    },
}
