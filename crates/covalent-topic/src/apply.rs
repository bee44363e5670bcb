//! The pure state machine: applying one change record to topic state.
//!
//! `apply_change` is deterministic and side-effect free. It never touches
//! IO, clocks or randomness, so every node folding the same event log in
//! the same order holds identical state. The runtime around it owns locks,
//! fan-out and compensating submissions.

use covalent_types::{EventId, ListKey, NodeId};
use serde_json::Value;

use crate::change::{AdjacencyCondition, ChangeRecord, ChangeResult};
use crate::details::{ChangeDetails, ListChange, ListChangeKind, MapChange};
use crate::state::{ListPosition, MapEntry, TopicData};

/// Result of applying one change record.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub result: ChangeResult,
    /// What changed, for subscriber fan-out. `None` for rejected changes
    /// and for non-collection changes (timeouts, membership).
    pub details: Option<ChangeDetails>,
}

impl ApplyOutcome {
    fn accepted(details: ChangeDetails) -> Self {
        Self {
            result: ChangeResult::Accepted,
            details: Some(details),
        }
    }

    fn accepted_silent() -> Self {
        Self {
            result: ChangeResult::Accepted,
            details: None,
        }
    }

    fn rejected() -> Self {
        Self {
            result: ChangeResult::Rejected,
            details: None,
        }
    }
}

/// Applies a committed change record to the state.
///
/// Returns whether the change was accepted and, for collection changes,
/// the details to fan out. Rejected changes leave the state untouched.
/// The record's event ID becomes the revision of any entry it writes.
pub fn apply_change(data: &mut TopicData, id: EventId, change: &ChangeRecord) -> ApplyOutcome {
    let outcome = match change {
        ChangeRecord::Put {
            name,
            key,
            value,
            expected_id,
            expected_value,
            scope_owner,
        } => apply_put(
            data,
            id,
            name,
            key,
            value,
            *expected_id,
            expected_value.as_ref(),
            *scope_owner,
        ),

        ChangeRecord::Replace {
            name,
            key,
            expected_value,
            value,
        } => apply_put(data, id, name, key, value, None, Some(expected_value), None),

        ChangeRecord::Insert {
            name,
            key,
            reference_key,
            before,
            item,
            conditions,
            scope_owner,
        } => apply_insert(
            data,
            id,
            name,
            *key,
            *reference_key,
            *before,
            item,
            conditions,
            *scope_owner,
        ),

        ChangeRecord::MoveBefore {
            name,
            reference_key,
            key_to_move,
        } => apply_move(data, id, name, ListPosition::Before(*reference_key), *key_to_move),

        ChangeRecord::MoveAfter {
            name,
            reference_key,
            key_to_move,
        } => apply_move(data, id, name, ListPosition::After(*reference_key), *key_to_move),

        ChangeRecord::ListSet {
            name,
            key,
            value,
            expected_id,
            scope_owner,
        } => apply_list_set(data, id, name, *key, value, *expected_id, *scope_owner),

        ChangeRecord::MapTimeout { name, value } => {
            match value {
                Some(timeout) => data.map_timeouts.insert(name.clone(), *timeout),
                None => data.map_timeouts.remove(name),
            };
            return ApplyOutcome::accepted_silent();
        }

        ChangeRecord::ListTimeout { name, value } => {
            match value {
                Some(timeout) => data.list_timeouts.insert(name.clone(), *timeout),
                None => data.list_timeouts.remove(name),
            };
            return ApplyOutcome::accepted_silent();
        }

        ChangeRecord::NodeJoin { node_id } => {
            if !data.backend_nodes.contains(node_id) {
                data.backend_nodes.push(*node_id);
            }
            return ApplyOutcome::accepted_silent();
        }

        ChangeRecord::NodeActivate { node_id } => {
            data.active_nodes.insert(*node_id);
            return ApplyOutcome::accepted_silent();
        }

        ChangeRecord::NodeDeactivate { node_id } => {
            data.active_nodes.shift_remove(node_id);
            return ApplyOutcome::accepted_silent();
        }
    };

    if outcome.result.is_accepted() && outcome.details.is_some() {
        data.change_count += 1;
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
fn apply_put(
    data: &mut TopicData,
    id: EventId,
    name: &str,
    key: &str,
    value: &Value,
    expected_id: Option<EventId>,
    expected_value: Option<&Value>,
    scope_owner: Option<NodeId>,
) -> ApplyOutcome {
    let current = data.maps.get(name).and_then(|map| map.get(key));

    // Both conditions must hold when both are present.
    if let Some(expected) = expected_id {
        if current.map(|entry| entry.revision) != Some(expected) {
            return ApplyOutcome::rejected();
        }
    }
    if let Some(expected) = expected_value {
        let current_value = current.map_or(&Value::Null, |entry| &entry.data);
        if current_value != expected {
            return ApplyOutcome::rejected();
        }
    }

    let old_value = current.map_or(Value::Null, |entry| entry.data.clone());

    if value.is_null() {
        match data.maps.get_mut(name).map(|map| map.shift_remove(key).is_some()) {
            Some(true) => {}
            // Removing an absent key is accepted but changes nothing.
            _ => return ApplyOutcome::accepted_silent(),
        }
    } else {
        data.maps.entry(name.to_string()).or_default().insert(
            key.to_string(),
            MapEntry {
                revision: id,
                data: value.clone(),
                scope_owner,
            },
        );
    }

    ApplyOutcome::accepted(ChangeDetails::Map(MapChange {
        name: name.to_string(),
        key: key.to_string(),
        old_value,
        new_value: value.clone(),
    }))
}

#[allow(clippy::too_many_arguments)]
fn apply_insert(
    data: &mut TopicData,
    id: EventId,
    name: &str,
    key: ListKey,
    reference_key: Option<ListKey>,
    before: bool,
    item: &Value,
    conditions: &[AdjacencyCondition],
    scope_owner: Option<NodeId>,
) -> ApplyOutcome {
    // Validate against the current list (absent = empty) before touching
    // state, so a rejection leaves `lists` untouched.
    {
        let current = data.lists.get(name);
        for condition in conditions {
            let holds = match current {
                Some(list) => list.successor_holds(condition.left, condition.right),
                None => condition.left.is_none() && condition.right.is_none(),
            };
            if !holds {
                return ApplyOutcome::rejected();
            }
        }
        if let Some(reference) = reference_key {
            if !current.is_some_and(|list| list.contains(reference)) {
                return ApplyOutcome::rejected();
            }
        }
    }

    let position = match (reference_key, before) {
        (Some(reference), true) => ListPosition::Before(reference),
        (Some(reference), false) => ListPosition::After(reference),
        // A null reference targets the boundary itself.
        (None, true) => ListPosition::Last,
        (None, false) => ListPosition::First,
    };

    let list = data.lists.entry(name.to_string()).or_default();
    if !list.insert(key, item.clone(), id, scope_owner, position) {
        return ApplyOutcome::rejected();
    }

    let entry = list.get(key).expect("just inserted");
    let (prev, next) = (entry.prev, entry.next);
    ApplyOutcome::accepted(ChangeDetails::List(ListChange {
        name: name.to_string(),
        key,
        kind: ListChangeKind::Insert,
        old_value: Value::Null,
        value: item.clone(),
        prev,
        next,
    }))
}

fn apply_move(
    data: &mut TopicData,
    id: EventId,
    name: &str,
    position: ListPosition,
    key_to_move: ListKey,
) -> ApplyOutcome {
    let Some(list) = data.lists.get_mut(name) else {
        return ApplyOutcome::rejected();
    };
    if !list.relocate(key_to_move, id, position) {
        return ApplyOutcome::rejected();
    }

    let entry = list.get(key_to_move).expect("relocated entry exists");
    let (value, prev, next) = (entry.value.clone(), entry.prev, entry.next);
    ApplyOutcome::accepted(ChangeDetails::List(ListChange {
        name: name.to_string(),
        key: key_to_move,
        kind: ListChangeKind::Move,
        old_value: value.clone(),
        value,
        prev,
        next,
    }))
}

fn apply_list_set(
    data: &mut TopicData,
    id: EventId,
    name: &str,
    key: ListKey,
    value: &Value,
    expected_id: Option<EventId>,
    scope_owner: Option<NodeId>,
) -> ApplyOutcome {
    let Some(list) = data.lists.get_mut(name) else {
        return ApplyOutcome::rejected();
    };
    let Some(current) = list.get(key) else {
        // Also covers LIST_SET(null) on an absent key: reject.
        return ApplyOutcome::rejected();
    };

    if let Some(expected) = expected_id {
        if current.revision != expected {
            return ApplyOutcome::rejected();
        }
    }

    let old_value = current.value.clone();

    if value.is_null() {
        list.unlink(key).expect("entry present");
        ApplyOutcome::accepted(ChangeDetails::List(ListChange {
            name: name.to_string(),
            key,
            kind: ListChangeKind::Remove,
            old_value,
            value: Value::Null,
            prev: None,
            next: None,
        }))
    } else {
        list.rewrite(key, value.clone(), id, scope_owner);
        let entry = list.get(key).expect("entry present");
        let (prev, next) = (entry.prev, entry.next);
        ApplyOutcome::accepted(ChangeDetails::List(ListChange {
            name: name.to_string(),
            key,
            kind: ListChangeKind::Set,
            old_value,
            value: value.clone(),
            prev,
            next,
        }))
    }
}
