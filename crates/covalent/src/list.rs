//! The named-list handle.

use std::sync::Arc;
use std::time::Duration;

use covalent_topic::{AdjacencyCondition, ChangeRecord, ListChangeKind};
use covalent_types::value::{ValueError, from_json_value, to_json_value};
use covalent_types::{EntryScope, ListKey, Registration};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::completion::Completion;
use crate::connection::{ScopedKey, TopicConnection};

/// One applied change to a list entry, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ListChangeEvent {
    /// Stable entry key; never changes across sets and moves.
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

impl ListChangeEvent {
    /// The new value, deserialized; `Ok(None)` for a removal.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>, ValueError> {
        if self.value.is_null() {
            return Ok(None);
        }
        from_json_value(&self.value).map(Some)
    }
}

/// A pending list insertion: the entry's stable key is known immediately,
/// the completion resolves once the insert has applied.
pub struct ListInsertion<T> {
    pub key: ListKey,
    pub completion: Completion<T>,
}

/// A named list of one topic, bound to a connection.
///
/// Entries form a stable-keyed sequence; reads return deep copies in list
/// order, writes round-trip the event log.
#[derive(Clone)]
pub struct SharedList {
    connection: Arc<TopicConnection>,
    name: String,
}

impl SharedList {
    pub(crate) fn new(connection: Arc<TopicConnection>, name: String) -> Self {
        Self { connection, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All values in list order, deserialized.
    pub fn items<T: DeserializeOwned>(&self) -> Result<Vec<T>, ValueError> {
        self.values().iter().map(from_json_value).collect()
    }

    /// All raw values in list order, deep-copied.
    pub fn values(&self) -> Vec<Value> {
        self.connection.topic().read(|data| {
            data.list(&self.name)
                .map(|list| list.iter().map(|(_, entry)| entry.value.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// All entry keys in list order.
    pub fn keys(&self) -> Vec<ListKey> {
        self.connection.topic().read(|data| {
            data.list(&self.name)
                .map(|list| list.iter().map(|(key, _)| key).collect())
                .unwrap_or_default()
        })
    }

    /// The value at `key`, deserialized; `Ok(None)` when absent.
    pub fn get<T: DeserializeOwned>(&self, key: ListKey) -> Result<Option<T>, ValueError> {
        let value = self
            .connection
            .topic()
            .read(|data| data.list(&self.name).and_then(|list| list.get(key).map(|e| e.value.clone())));
        match value {
            Some(value) => from_json_value(&value).map(Some),
            None => Ok(None),
        }
    }

    /// Appends a topic-scoped value.
    pub fn insert_last(&self, value: impl Serialize) -> ListInsertion<()> {
        self.insert_boundary(value, EntryScope::Topic, true)
    }

    /// Prepends a topic-scoped value.
    pub fn insert_first(&self, value: impl Serialize) -> ListInsertion<()> {
        self.insert_boundary(value, EntryScope::Topic, false)
    }

    /// Appends a value with the given scope.
    pub fn insert_last_with_scope(
        &self,
        value: impl Serialize,
        scope: EntryScope,
    ) -> ListInsertion<()> {
        self.insert_boundary(value, scope, true)
    }

    /// Prepends a value with the given scope.
    pub fn insert_first_with_scope(
        &self,
        value: impl Serialize,
        scope: EntryScope,
    ) -> ListInsertion<()> {
        self.insert_boundary(value, scope, false)
    }

    fn insert_boundary(
        &self,
        value: impl Serialize,
        scope: EntryScope,
        at_tail: bool,
    ) -> ListInsertion<()> {
        let item = to_json_value(&value).expect("value must serialize to a JSON document");
        let key = ListKey::random();
        let (scope_owner, tracked) = self.scope_parts(key, scope);
        let completion = self.connection.submit_void(
            ChangeRecord::Insert {
                name: self.name.clone(),
                key,
                reference_key: None,
                before: at_tail,
                item,
                conditions: Vec::new(),
                scope_owner,
            },
            tracked,
        );
        ListInsertion { key, completion }
    }

    /// Inserts before an existing entry. Resolves to `false` when the
    /// reference no longer exists.
    pub fn insert_before(&self, reference: ListKey, value: impl Serialize) -> ListInsertion<bool> {
        self.insert_relative(reference, value, true)
    }

    /// Inserts after an existing entry.
    pub fn insert_after(&self, reference: ListKey, value: impl Serialize) -> ListInsertion<bool> {
        self.insert_relative(reference, value, false)
    }

    fn insert_relative(
        &self,
        reference: ListKey,
        value: impl Serialize,
        before: bool,
    ) -> ListInsertion<bool> {
        let item = to_json_value(&value).expect("value must serialize to a JSON document");
        let key = ListKey::random();
        let completion = self.connection.submit_bool(
            ChangeRecord::Insert {
                name: self.name.clone(),
                key,
                reference_key: Some(reference),
                before,
                item,
                conditions: Vec::new(),
                scope_owner: None,
            },
            None,
        );
        ListInsertion { key, completion }
    }

    /// Inserts between two entries, atomically asserting they are still
    /// adjacent (`None` bounds stand for head/tail).
    pub fn insert_between(
        &self,
        prev: Option<ListKey>,
        next: Option<ListKey>,
        value: impl Serialize,
    ) -> ListInsertion<bool> {
        let item = to_json_value(&value).expect("value must serialize to a JSON document");
        let key = ListKey::random();
        let completion = self.connection.submit_bool(
            ChangeRecord::Insert {
                name: self.name.clone(),
                key,
                reference_key: prev,
                // With a null reference this prepends to the head, which is
                // exactly "between the head boundary and `next`".
                before: false,
                item,
                conditions: vec![AdjacencyCondition { left: prev, right: next }],
                scope_owner: None,
            },
            None,
        );
        ListInsertion { key, completion }
    }

    /// Rewrites the value at `key`, keeping its position. Resolves to
    /// `false` when the entry no longer exists.
    pub fn set(&self, key: ListKey, value: impl Serialize) -> Completion<bool> {
        self.set_with_scope(key, value, EntryScope::Topic)
    }

    /// Rewrites the value at `key` with the given scope.
    pub fn set_with_scope(
        &self,
        key: ListKey,
        value: impl Serialize,
        scope: EntryScope,
    ) -> Completion<bool> {
        let value = to_json_value(&value).expect("value must serialize to a JSON document");
        let (scope_owner, tracked) = self.scope_parts(key, scope);
        self.connection.submit_bool(
            ChangeRecord::ListSet {
                name: self.name.clone(),
                key,
                value,
                expected_id: None,
                scope_owner,
            },
            tracked,
        )
    }

    /// Removes the entry at `key`. Resolves to `false` when it no longer
    /// exists.
    pub fn delete(&self, key: ListKey) -> Completion<bool> {
        self.connection.submit_bool(
            ChangeRecord::ListSet {
                name: self.name.clone(),
                key,
                value: Value::Null,
                expected_id: None,
                scope_owner: None,
            },
            None,
        )
    }

    /// Moves `key` in front of `reference`. Resolves to `false` when
    /// either entry is gone.
    pub fn move_before(&self, reference: ListKey, key: ListKey) -> Completion<bool> {
        self.connection.submit_bool(
            ChangeRecord::MoveBefore {
                name: self.name.clone(),
                reference_key: reference,
                key_to_move: key,
            },
            None,
        )
    }

    /// Moves `key` behind `reference`.
    pub fn move_after(&self, reference: ListKey, key: ListKey) -> Completion<bool> {
        self.connection.submit_bool(
            ChangeRecord::MoveAfter {
                name: self.name.clone(),
                reference_key: reference,
                key_to_move: key,
            },
            None,
        )
    }

    /// Moves `key` between two entries.
    ///
    /// # Panics
    ///
    /// Panics when both bounds are `None`; a move needs at least one
    /// reference entry.
    pub fn move_between(
        &self,
        prev: Option<ListKey>,
        next: Option<ListKey>,
        key: ListKey,
    ) -> Completion<bool> {
        match (prev, next) {
            (Some(reference), _) => self.move_after(reference, key),
            (None, Some(reference)) => self.move_before(reference, key),
            (None, None) => panic!("move_between requires at least one reference entry"),
        }
    }

    /// Subscribes to changes of this list.
    ///
    /// The handler first receives one synthetic insert per current entry,
    /// head to tail, then every subsequent change, all on the connection's
    /// dispatcher.
    pub fn subscribe(
        &self,
        handler: impl FnMut(&ListChangeEvent) + Send + 'static,
    ) -> Registration {
        self.connection.subscribe_list(&self.name, Box::new(handler))
    }

    /// The list's idle-expiration timeout, if set.
    pub fn expiration_timeout(&self) -> Option<Duration> {
        self.connection.topic().read(|data| data.list_timeout(&self.name))
    }

    /// Sets (`Some`) or clears (`None`) the idle-expiration timeout.
    pub fn set_expiration_timeout(&self, timeout: Option<Duration>) -> Completion<()> {
        self.connection.submit_void(
            ChangeRecord::ListTimeout {
                name: self.name.clone(),
                value: timeout,
            },
            None,
        )
    }

    fn scope_parts(
        &self,
        key: ListKey,
        scope: EntryScope,
    ) -> (Option<covalent_types::NodeId>, Option<ScopedKey>) {
        match scope {
            EntryScope::Topic => (None, None),
            EntryScope::Connection => (
                Some(self.connection.topic().local_node()),
                Some(ScopedKey::List(self.name.clone(), key)),
            ),
        }
    }
}

impl std::fmt::Debug for SharedList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedList").field("name", &self.name).finish()
    }
}
