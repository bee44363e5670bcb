//! The named-map handle.

use std::sync::Arc;
use std::time::Duration;

use covalent_topic::ChangeRecord;
use covalent_types::value::{ValueError, from_json_value, to_json_value};
use covalent_types::{EntryScope, Registration};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::completion::Completion;
use crate::connection::{ScopedKey, TopicConnection};

/// One applied change to a map key, as seen by subscribers.
///
/// `null` stands for absence: `old_value = null` is an insert,
/// `value = null` a removal.
#[derive(Debug, Clone, PartialEq)]
pub struct MapChangeEvent {
    pub key: String,
    pub old_value: Value,
    pub value: Value,
}

impl MapChangeEvent {
    /// The new value, deserialized; `Ok(None)` for a removal.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>, ValueError> {
        if self.value.is_null() {
            return Ok(None);
        }
        from_json_value(&self.value).map(Some)
    }
}

/// A named map of one topic, bound to a connection.
///
/// Reads return deep copies taken under the topic lock; writes round-trip
/// the event log and resolve their completion on the connection's
/// dispatcher.
#[derive(Clone)]
pub struct SharedMap {
    connection: Arc<TopicConnection>,
    name: String,
}

impl SharedMap {
    pub(crate) fn new(connection: Arc<TopicConnection>, name: String) -> Self {
        Self { connection, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value at `key`, deserialized. `Ok(None)` when absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ValueError> {
        match self.get_value(key) {
            Some(value) => from_json_value(&value).map(Some),
            None => Ok(None),
        }
    }

    /// The raw JSON value at `key`, deep-copied.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.connection
            .topic()
            .read(|data| data.map_entry(&self.name, key).map(|entry| entry.data.clone()))
    }

    /// All keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.connection.topic().read(|data| {
            data.map(&self.name)
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Puts a topic-scoped value.
    pub fn put(&self, key: &str, value: impl Serialize) -> Completion<()> {
        self.put_with_scope(key, value, EntryScope::Topic)
    }

    /// Puts a value with the given scope. Connection-scoped entries are
    /// removed automatically when this connection deactivates or its node
    /// leaves.
    pub fn put_with_scope(
        &self,
        key: &str,
        value: impl Serialize,
        scope: EntryScope,
    ) -> Completion<()> {
        let value = to_json_value(&value).expect("value must serialize to a JSON document");
        let (scope_owner, tracked) = self.scope_parts(key, scope);
        self.connection.submit_void(
            ChangeRecord::Put {
                name: self.name.clone(),
                key: key.to_string(),
                value,
                expected_id: None,
                expected_value: None,
                scope_owner,
            },
            tracked,
        )
    }

    /// Removes `key`. Resolves once the removal has applied.
    pub fn remove(&self, key: &str) -> Completion<()> {
        self.connection.submit_void(
            ChangeRecord::Put {
                name: self.name.clone(),
                key: key.to_string(),
                value: Value::Null,
                expected_id: None,
                expected_value: None,
                scope_owner: None,
            },
            None,
        )
    }

    /// Compare-and-set on the prior value (`expected` must equal the
    /// current value; use JSON `null` semantics via [`SharedMap::replace_absent`]
    /// for expecting absence). Resolves to whether the write was accepted.
    pub fn replace(
        &self,
        key: &str,
        expected: impl Serialize,
        value: impl Serialize,
    ) -> Completion<bool> {
        let expected =
            to_json_value(&expected).expect("expected value must serialize to a JSON document");
        let value = to_json_value(&value).expect("value must serialize to a JSON document");
        self.connection.submit_bool(
            ChangeRecord::Replace {
                name: self.name.clone(),
                key: key.to_string(),
                expected_value: expected,
                value,
            },
            None,
        )
    }

    /// Compare-and-set expecting the key to be absent.
    pub fn replace_absent(&self, key: &str, value: impl Serialize) -> Completion<bool> {
        let value = to_json_value(&value).expect("value must serialize to a JSON document");
        self.connection.submit_bool(
            ChangeRecord::Replace {
                name: self.name.clone(),
                key: key.to_string(),
                expected_value: Value::Null,
                value,
            },
            None,
        )
    }

    /// Subscribes to changes of this map.
    ///
    /// The handler first receives one synthetic event per current entry in
    /// insertion order, then every subsequent change, all on the
    /// connection's dispatcher.
    pub fn subscribe(&self, handler: impl FnMut(&MapChangeEvent) + Send + 'static) -> Registration {
        self.connection.subscribe_map(&self.name, Box::new(handler))
    }

    /// The map's idle-expiration timeout, if set.
    pub fn expiration_timeout(&self) -> Option<Duration> {
        self.connection.topic().read(|data| data.map_timeout(&self.name))
    }

    /// Sets (`Some`) or clears (`None`) the idle-expiration timeout.
    pub fn set_expiration_timeout(&self, timeout: Option<Duration>) -> Completion<()> {
        self.connection.submit_void(
            ChangeRecord::MapTimeout {
                name: self.name.clone(),
                value: timeout,
            },
            None,
        )
    }

    fn scope_parts(
        &self,
        key: &str,
        scope: EntryScope,
    ) -> (Option<covalent_types::NodeId>, Option<ScopedKey>) {
        match scope {
            EntryScope::Topic => (None, None),
            EntryScope::Connection => (
                Some(self.connection.topic().local_node()),
                Some(ScopedKey::Map(self.name.clone(), key.to_string())),
            ),
        }
    }
}

impl std::fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMap").field("name", &self.name).finish()
    }
}
