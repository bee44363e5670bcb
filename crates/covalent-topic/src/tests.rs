//! Unit tests for the topic state machine and runtime.
//!
//! The apply step is pure (no IO), so every code path is testable without
//! mocks; the runtime tests drive real `LocalBackend` nodes on a shared
//! hub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use covalent_backend::{Backend, LocalBackend, LogHub};
use covalent_types::{EventId, ListKey, NodeId};
use serde_json::{Value, json};

use crate::apply::apply_change;
use crate::change::{AdjacencyCondition, ChangeRecord, ChangeResult};
use crate::details::{ChangeDetails, ListChangeKind};
use crate::snapshot::TopicSnapshot;
use crate::state::{ListData, TopicData};
use crate::topic::Topic;

// ============================================================================
// Test Helpers
// ============================================================================

fn put(name: &str, key: &str, value: Value) -> ChangeRecord {
    ChangeRecord::Put {
        name: name.into(),
        key: key.into(),
        value,
        expected_id: None,
        expected_value: None,
        scope_owner: None,
    }
}

fn insert_last(name: &str, key: ListKey, item: Value) -> ChangeRecord {
    ChangeRecord::Insert {
        name: name.into(),
        key,
        reference_key: None,
        before: true,
        item,
        conditions: Vec::new(),
        scope_owner: None,
    }
}

fn insert_first(name: &str, key: ListKey, item: Value) -> ChangeRecord {
    ChangeRecord::Insert {
        name: name.into(),
        key,
        reference_key: None,
        before: false,
        item,
        conditions: Vec::new(),
        scope_owner: None,
    }
}

/// Applies with a fresh random ID, asserting acceptance.
fn apply_ok(data: &mut TopicData, change: &ChangeRecord) -> EventId {
    let id = EventId::random();
    let outcome = apply_change(data, id, change);
    assert!(
        outcome.result.is_accepted(),
        "change unexpectedly rejected: {change:?}"
    );
    id
}

fn apply_rejected(data: &mut TopicData, change: &ChangeRecord) {
    let before = data.clone();
    let outcome = apply_change(data, EventId::random(), change);
    assert_eq!(outcome.result, ChangeResult::Rejected);
    assert!(outcome.details.is_none());
    assert_eq!(*data, before, "rejected change must not mutate state");
}

fn list_values(data: &TopicData, name: &str) -> Vec<Value> {
    data.list(name)
        .map(|list| list.iter().map(|(_, entry)| entry.value.clone()).collect())
        .unwrap_or_default()
}

fn list_keys(data: &TopicData, name: &str) -> Vec<ListKey> {
    data.list(name)
        .map(|list| list.iter().map(|(key, _)| key).collect())
        .unwrap_or_default()
}

/// Checks the doubly-linked-list invariants: unique keys, consistent
/// neighbor links, boundary entries terminating in `None`.
fn assert_list_invariants(list: &ListData) {
    let traversal: Vec<_> = list.iter().collect();
    assert_eq!(traversal.len(), list.len(), "traversal must visit every entry once");

    for (index, (key, entry)) in traversal.iter().enumerate() {
        let expected_prev = if index == 0 {
            None
        } else {
            Some(traversal[index - 1].0)
        };
        let expected_next = traversal.get(index + 1).map(|(next_key, _)| *next_key);
        assert_eq!(entry.prev, expected_prev, "prev link of {key}");
        assert_eq!(entry.next, expected_next, "next link of {key}");
    }

    assert_eq!(list.head(), traversal.first().map(|(key, _)| *key));
    assert_eq!(list.tail(), traversal.last().map(|(key, _)| *key));
}

// ============================================================================
// Map Changes
// ============================================================================

#[test]
fn put_inserts_and_stamps_revision() {
    let mut data = TopicData::new();
    let id = apply_ok(&mut data, &put("form", "title", json!("draft")));

    let entry = data.map_entry("form", "title").expect("entry exists");
    assert_eq!(entry.revision, id);
    assert_eq!(entry.data, json!("draft"));
    assert_eq!(data.change_count(), 1);
}

#[test]
fn put_overwrite_reports_old_and_new_value() {
    let mut data = TopicData::new();
    apply_ok(&mut data, &put("form", "title", json!("a")));

    let outcome = apply_change(&mut data, EventId::random(), &put("form", "title", json!("b")));
    let Some(ChangeDetails::Map(change)) = outcome.details else {
        panic!("expected map details");
    };
    assert_eq!(change.old_value, json!("a"));
    assert_eq!(change.new_value, json!("b"));
}

#[test]
fn put_null_removes_the_key() {
    let mut data = TopicData::new();
    apply_ok(&mut data, &put("form", "title", json!("draft")));
    apply_ok(&mut data, &put("form", "title", Value::Null));
    assert!(data.map_entry("form", "title").is_none());
}

#[test]
fn put_null_on_absent_key_is_accepted_but_silent() {
    let mut data = TopicData::new();
    let outcome = apply_change(&mut data, EventId::random(), &put("form", "ghost", Value::Null));
    assert!(outcome.result.is_accepted());
    assert!(outcome.details.is_none());
    assert_eq!(data.change_count(), 0);
}

#[test]
fn put_with_expected_id_is_compare_and_set() {
    let mut data = TopicData::new();
    let revision = apply_ok(&mut data, &put("form", "title", json!("a")));

    let stale = ChangeRecord::Put {
        name: "form".into(),
        key: "title".into(),
        value: json!("b"),
        expected_id: Some(EventId::random()),
        expected_value: None,
        scope_owner: None,
    };
    apply_rejected(&mut data, &stale);

    let current = ChangeRecord::Put {
        name: "form".into(),
        key: "title".into(),
        value: json!("b"),
        expected_id: Some(revision),
        expected_value: None,
        scope_owner: None,
    };
    apply_ok(&mut data, &current);
    assert_eq!(data.map_entry("form", "title").unwrap().data, json!("b"));
}

#[test]
fn put_with_both_conditions_requires_both() {
    let mut data = TopicData::new();
    let revision = apply_ok(&mut data, &put("form", "title", json!("a")));

    let wrong_value = ChangeRecord::Put {
        name: "form".into(),
        key: "title".into(),
        value: json!("b"),
        expected_id: Some(revision),
        expected_value: Some(json!("not-a")),
        scope_owner: None,
    };
    apply_rejected(&mut data, &wrong_value);
}

#[test]
fn replace_compares_prior_value() {
    let mut data = TopicData::new();
    apply_ok(&mut data, &put("state", "counter", json!(0)));

    let replace = ChangeRecord::Replace {
        name: "state".into(),
        key: "counter".into(),
        expected_value: json!(0),
        value: json!(1),
    };
    apply_ok(&mut data, &replace);

    // The same replace no longer matches.
    apply_rejected(&mut data, &replace.clone());
    assert_eq!(data.map_entry("state", "counter").unwrap().data, json!(1));
}

#[test]
fn replace_expecting_null_means_expecting_absence() {
    let mut data = TopicData::new();
    let replace = ChangeRecord::Replace {
        name: "state".into(),
        key: "fresh".into(),
        expected_value: Value::Null,
        value: json!(1),
    };
    apply_ok(&mut data, &replace);
    apply_rejected(&mut data, &replace);
}

#[test]
fn replace_identical_value_is_accepted_and_idempotent() {
    let mut data = TopicData::new();
    apply_ok(&mut data, &put("state", "k", json!("a")));

    let replace = ChangeRecord::Replace {
        name: "state".into(),
        key: "k".into(),
        expected_value: json!("a"),
        value: json!("a"),
    };
    let id = apply_ok(&mut data, &replace);
    let entry = data.map_entry("state", "k").unwrap();
    assert_eq!(entry.data, json!("a"));
    assert_eq!(entry.revision, id, "accepted writes always restamp the revision");
}

#[test]
fn map_keys_preserve_insertion_order() {
    let mut data = TopicData::new();
    for key in ["c", "a", "b"] {
        apply_ok(&mut data, &put("m", key, json!(1)));
    }
    // Overwriting must not reorder.
    apply_ok(&mut data, &put("m", "c", json!(2)));

    let keys: Vec<_> = data.map("m").unwrap().keys().cloned().collect();
    assert_eq!(keys, ["c", "a", "b"]);
}

// ============================================================================
// List Changes
// ============================================================================

#[test]
fn insert_into_empty_list_becomes_the_only_entry() {
    let mut data = TopicData::new();
    let key = ListKey::random();
    let id = apply_ok(&mut data, &insert_last("chat", key, json!("hello")));

    let list = data.list("chat").unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list.head(), Some(key));
    assert_eq!(list.tail(), Some(key));
    assert_eq!(list.get(key).unwrap().revision, id);
    assert_list_invariants(list);
}

#[test]
fn insert_last_appends_and_insert_first_prepends() {
    let mut data = TopicData::new();
    let (a, b, c) = (ListKey::random(), ListKey::random(), ListKey::random());
    apply_ok(&mut data, &insert_last("l", a, json!("a")));
    apply_ok(&mut data, &insert_last("l", b, json!("b")));
    apply_ok(&mut data, &insert_first("l", c, json!("c")));

    assert_eq!(list_values(&data, "l"), vec![json!("c"), json!("a"), json!("b")]);
    assert_list_invariants(data.list("l").unwrap());
}

#[test]
fn insert_before_and_after_a_reference() {
    let mut data = TopicData::new();
    let (a, b, c) = (ListKey::random(), ListKey::random(), ListKey::random());
    apply_ok(&mut data, &insert_last("l", a, json!("a")));

    apply_ok(
        &mut data,
        &ChangeRecord::Insert {
            name: "l".into(),
            key: b,
            reference_key: Some(a),
            before: true,
            item: json!("b"),
            conditions: Vec::new(),
            scope_owner: None,
        },
    );
    apply_ok(
        &mut data,
        &ChangeRecord::Insert {
            name: "l".into(),
            key: c,
            reference_key: Some(a),
            before: false,
            item: json!("c"),
            conditions: Vec::new(),
            scope_owner: None,
        },
    );

    assert_eq!(list_values(&data, "l"), vec![json!("b"), json!("a"), json!("c")]);
    assert_list_invariants(data.list("l").unwrap());
}

#[test]
fn insert_with_missing_reference_rejects() {
    let mut data = TopicData::new();
    apply_ok(&mut data, &insert_last("l", ListKey::random(), json!("a")));

    apply_rejected(
        &mut data,
        &ChangeRecord::Insert {
            name: "l".into(),
            key: ListKey::random(),
            reference_key: Some(ListKey::random()),
            before: true,
            item: json!("x"),
            conditions: Vec::new(),
            scope_owner: None,
        },
    );
}

#[test]
fn insert_conditions_assert_adjacency() {
    let mut data = TopicData::new();
    let (a, b) = (ListKey::random(), ListKey::random());
    apply_ok(&mut data, &insert_last("l", a, json!("a")));
    apply_ok(&mut data, &insert_last("l", b, json!("b")));

    // Between a and b: holds.
    let between = ChangeRecord::Insert {
        name: "l".into(),
        key: ListKey::random(),
        reference_key: Some(a),
        before: false,
        item: json!("x"),
        conditions: vec![AdjacencyCondition {
            left: Some(a),
            right: Some(b),
        }],
        scope_owner: None,
    };
    apply_ok(&mut data, &between);

    // a and b are no longer adjacent; the same conditions now fail.
    apply_rejected(
        &mut data,
        &ChangeRecord::Insert {
            name: "l".into(),
            key: ListKey::random(),
            reference_key: Some(a),
            before: false,
            item: json!("y"),
            conditions: vec![AdjacencyCondition {
                left: Some(a),
                right: Some(b),
            }],
            scope_owner: None,
        },
    );
}

#[test]
fn boundary_conditions_on_an_empty_list() {
    let mut data = TopicData::new();
    // (head, tail) adjacency on an empty (nonexistent) list holds.
    apply_ok(
        &mut data,
        &ChangeRecord::Insert {
            name: "l".into(),
            key: ListKey::random(),
            reference_key: None,
            before: true,
            item: json!("a"),
            conditions: vec![AdjacencyCondition {
                left: None,
                right: None,
            }],
            scope_owner: None,
        },
    );
    // Now the list is non-empty and the same condition fails.
    apply_rejected(
        &mut data,
        &ChangeRecord::Insert {
            name: "l".into(),
            key: ListKey::random(),
            reference_key: None,
            before: true,
            item: json!("b"),
            conditions: vec![AdjacencyCondition {
                left: None,
                right: None,
            }],
            scope_owner: None,
        },
    );
}

#[test]
fn move_before_and_after_relink_and_restamp() {
    let mut data = TopicData::new();
    let (a, b, c) = (ListKey::random(), ListKey::random(), ListKey::random());
    for (key, value) in [(a, "a"), (b, "b"), (c, "c")] {
        apply_ok(&mut data, &insert_last("l", key, json!(value)));
    }

    let move_id = apply_ok(
        &mut data,
        &ChangeRecord::MoveBefore {
            name: "l".into(),
            reference_key: a,
            key_to_move: c,
        },
    );
    assert_eq!(list_values(&data, "l"), vec![json!("c"), json!("a"), json!("b")]);
    assert_eq!(data.list("l").unwrap().get(c).unwrap().revision, move_id);
    assert_list_invariants(data.list("l").unwrap());

    apply_ok(
        &mut data,
        &ChangeRecord::MoveAfter {
            name: "l".into(),
            reference_key: b,
            key_to_move: c,
        },
    );
    assert_eq!(list_values(&data, "l"), vec![json!("a"), json!("b"), json!("c")]);
    assert_list_invariants(data.list("l").unwrap());
}

#[test]
fn move_with_absent_key_rejects() {
    let mut data = TopicData::new();
    let a = ListKey::random();
    apply_ok(&mut data, &insert_last("l", a, json!("a")));

    apply_rejected(
        &mut data,
        &ChangeRecord::MoveBefore {
            name: "l".into(),
            reference_key: a,
            key_to_move: ListKey::random(),
        },
    );
    apply_rejected(
        &mut data,
        &ChangeRecord::MoveAfter {
            name: "l".into(),
            reference_key: ListKey::random(),
            key_to_move: a,
        },
    );
}

#[test]
fn move_to_already_adjacent_position_keeps_order() {
    let mut data = TopicData::new();
    let (a, b) = (ListKey::random(), ListKey::random());
    apply_ok(&mut data, &insert_last("l", a, json!("a")));
    apply_ok(&mut data, &insert_last("l", b, json!("b")));

    apply_ok(
        &mut data,
        &ChangeRecord::MoveAfter {
            name: "l".into(),
            reference_key: a,
            key_to_move: b,
        },
    );
    assert_eq!(list_keys(&data, "l"), vec![a, b]);
    assert_list_invariants(data.list("l").unwrap());
}

#[test]
fn list_set_rewrites_value_and_revision_but_not_key() {
    let mut data = TopicData::new();
    let key = ListKey::random();
    apply_ok(&mut data, &insert_last("l", key, json!("old")));

    let id = apply_ok(
        &mut data,
        &ChangeRecord::ListSet {
            name: "l".into(),
            key,
            value: json!("new"),
            expected_id: None,
            scope_owner: None,
        },
    );

    let entry = data.list("l").unwrap().get(key).unwrap();
    assert_eq!(entry.value, json!("new"));
    assert_eq!(entry.revision, id);
}

#[test]
fn list_set_null_removes_and_rejects_on_absent_key() {
    let mut data = TopicData::new();
    let key = ListKey::random();
    apply_ok(&mut data, &insert_last("l", key, json!("x")));

    let remove = ChangeRecord::ListSet {
        name: "l".into(),
        key,
        value: Value::Null,
        expected_id: None,
        scope_owner: None,
    };
    let outcome = apply_change(&mut data, EventId::random(), &remove);
    assert!(outcome.result.is_accepted());
    match outcome.details {
        Some(ChangeDetails::List(change)) => {
            assert_eq!(change.kind, ListChangeKind::Remove);
            assert_eq!(change.old_value, json!("x"));
        }
        other => panic!("expected list details, got {other:?}"),
    }
    assert!(data.list("l").unwrap().is_empty());

    // Removing it again must reject.
    apply_rejected(&mut data, &remove);
}

#[test]
fn list_set_with_stale_revision_rejects() {
    let mut data = TopicData::new();
    let key = ListKey::random();
    let revision = apply_ok(&mut data, &insert_last("l", key, json!("a")));
    apply_ok(
        &mut data,
        &ChangeRecord::ListSet {
            name: "l".into(),
            key,
            value: json!("b"),
            expected_id: Some(revision),
            scope_owner: None,
        },
    );
    // The first writer's revision is stale now.
    apply_rejected(
        &mut data,
        &ChangeRecord::ListSet {
            name: "l".into(),
            key,
            value: json!("c"),
            expected_id: Some(revision),
            scope_owner: None,
        },
    );
}

// ============================================================================
// Timeouts & Membership Records
// ============================================================================

#[test]
fn timeout_records_set_and_clear() {
    let mut data = TopicData::new();
    apply_ok(
        &mut data,
        &ChangeRecord::MapTimeout {
            name: "m".into(),
            value: Some(Duration::from_secs(60)),
        },
    );
    apply_ok(
        &mut data,
        &ChangeRecord::ListTimeout {
            name: "l".into(),
            value: Some(Duration::from_secs(30)),
        },
    );
    assert_eq!(data.map_timeout("m"), Some(Duration::from_secs(60)));
    assert_eq!(data.list_timeout("l"), Some(Duration::from_secs(30)));

    apply_ok(&mut data, &ChangeRecord::MapTimeout { name: "m".into(), value: None });
    assert_eq!(data.map_timeout("m"), None);
    // Timeouts are not collection mutations.
    assert_eq!(data.change_count(), 0);
}

#[test]
fn node_join_keeps_join_order_and_dedupes() {
    let mut data = TopicData::new();
    let (n1, n2) = (NodeId::random(), NodeId::random());
    apply_ok(&mut data, &ChangeRecord::NodeJoin { node_id: n1 });
    apply_ok(&mut data, &ChangeRecord::NodeJoin { node_id: n2 });
    apply_ok(&mut data, &ChangeRecord::NodeJoin { node_id: n1 });

    assert_eq!(data.backend_nodes().to_vec(), vec![n1, n2]);
    assert_eq!(data.leader_node(), Some(n1));
}

#[test]
fn node_activate_and_deactivate_track_the_active_set() {
    let mut data = TopicData::new();
    let node = NodeId::random();
    apply_ok(&mut data, &ChangeRecord::NodeActivate { node_id: node });
    assert_eq!(data.active_nodes().collect::<Vec<_>>(), vec![node]);
    apply_ok(&mut data, &ChangeRecord::NodeDeactivate { node_id: node });
    assert_eq!(data.active_nodes().count(), 0);
}

// ============================================================================
// Determinism & Snapshots
// ============================================================================

/// A mixed sequence of changes with fixed IDs, for replay comparisons.
fn scripted_changes() -> Vec<(EventId, ChangeRecord)> {
    let (a, b, c) = (ListKey::random(), ListKey::random(), ListKey::random());
    let owner = NodeId::random();
    let changes = vec![
        put("form", "title", json!("draft")),
        put("form", "author", json!({"id": "u1"})),
        insert_last("chat", a, json!("first")),
        insert_last("chat", b, json!("second")),
        insert_first("chat", c, json!("zeroth")),
        ChangeRecord::MoveAfter {
            name: "chat".into(),
            reference_key: b,
            key_to_move: c,
        },
        ChangeRecord::ListSet {
            name: "chat".into(),
            key: a,
            value: json!("first, edited"),
            expected_id: None,
            scope_owner: Some(owner),
        },
        ChangeRecord::MapTimeout {
            name: "form".into(),
            value: Some(Duration::from_secs(90)),
        },
        ChangeRecord::NodeJoin {
            node_id: owner,
        },
        put("form", "title", Value::Null),
    ];
    changes
        .into_iter()
        .map(|change| (EventId::random(), change))
        .collect()
}

#[test]
fn identical_logs_fold_to_identical_state() {
    let script = scripted_changes();

    let mut first = TopicData::new();
    let mut second = TopicData::new();
    for (id, change) in &script {
        apply_change(&mut first, *id, change);
        apply_change(&mut second, *id, change);
    }

    assert_eq!(first, second);
}

#[test]
fn snapshot_round_trips_any_reachable_state() {
    let mut data = TopicData::new();
    for (id, change) in scripted_changes() {
        apply_change(&mut data, id, &change);
    }

    let latest = Some(EventId::random());
    let snapshot = TopicSnapshot::capture(&data, latest);
    let blob = snapshot.encode().expect("encode");
    let decoded = TopicSnapshot::decode(&blob).expect("decode");
    assert_eq!(decoded.latest, latest);

    let restored = decoded.restore().expect("restore");
    assert_eq!(restored.maps, data.maps);
    assert_eq!(restored.lists, data.lists);
    assert_eq!(restored.map_timeouts, data.map_timeouts);
    assert_eq!(restored.list_timeouts, data.list_timeouts);
    assert_eq!(restored.backend_nodes, data.backend_nodes);
    for list in restored.lists.values() {
        assert_list_invariants(list);
    }
}

// ============================================================================
// Property Tests
// ============================================================================

mod properties {
    use proptest::prelude::*;

    use super::*;

    /// Driver turning raw tuples into list operations against current keys.
    fn run_ops(ops: &[(u8, u8, u8)]) -> TopicData {
        let mut data = TopicData::new();
        for (op, target, reference) in ops {
            let keys = list_keys(&data, "l");
            let pick = |selector: u8| -> Option<ListKey> {
                if keys.is_empty() {
                    None
                } else {
                    Some(keys[selector as usize % keys.len()])
                }
            };

            let change = match op % 5 {
                0 => insert_last("l", ListKey::random(), json!(*target)),
                1 => insert_first("l", ListKey::random(), json!(*target)),
                2 => match pick(*target) {
                    Some(key) => ChangeRecord::ListSet {
                        name: "l".into(),
                        key,
                        value: Value::Null,
                        expected_id: None,
                        scope_owner: None,
                    },
                    None => continue,
                },
                3 => match (pick(*target), pick(*reference)) {
                    (Some(key_to_move), Some(reference_key)) => ChangeRecord::MoveBefore {
                        name: "l".into(),
                        reference_key,
                        key_to_move,
                    },
                    _ => continue,
                },
                _ => match pick(*target) {
                    Some(key) => ChangeRecord::ListSet {
                        name: "l".into(),
                        key,
                        value: json!(*reference),
                        expected_id: None,
                        scope_owner: None,
                    },
                    None => continue,
                },
            };
            apply_change(&mut data, EventId::random(), &change);

            if let Some(list) = data.list("l") {
                assert_list_invariants(list);
            }
        }
        data
    }

    proptest! {
        #[test]
        fn list_invariants_hold_under_random_ops(ops in proptest::collection::vec(any::<(u8, u8, u8)>(), 0..64)) {
            run_ops(&ops);
        }

        #[test]
        fn random_op_sequences_are_deterministic(ops in proptest::collection::vec(any::<(u8, u8, u8)>(), 0..32)) {
            // Two independent folds of the same script; randomness inside
            // run_ops (fresh keys/ids) prevents direct comparison, so fold
            // a recorded script instead.
            let mut recorder = TopicData::new();
            let mut script = Vec::new();
            for (op, target, _) in &ops {
                let keys = list_keys(&recorder, "l");
                let change = if op % 2 == 0 || keys.is_empty() {
                    insert_last("l", ListKey::random(), json!(*target))
                } else {
                    ChangeRecord::ListSet {
                        name: "l".into(),
                        key: keys[*target as usize % keys.len()],
                        value: Value::Null,
                        expected_id: None,
                        scope_owner: None,
                    }
                };
                let id = EventId::random();
                apply_change(&mut recorder, id, &change);
                script.push((id, change));
            }

            let mut replayed = TopicData::new();
            for (id, change) in &script {
                apply_change(&mut replayed, *id, change);
            }
            prop_assert_eq!(replayed, recorder);
        }
    }
}

// ============================================================================
// Topic Runtime
// ============================================================================

fn collect_results() -> (Arc<Mutex<Vec<ChangeResult>>>, impl Fn() -> crate::topic::ResultHandler) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let handle = Arc::clone(&results);
    let make = move || -> crate::topic::ResultHandler {
        let sink = Arc::clone(&handle);
        Box::new(move |result| sink.lock().unwrap().push(result))
    };
    (results, make)
}

#[test]
fn submitted_changes_apply_and_resolve_trackers() {
    let topic = Topic::open("doc", Arc::new(LocalBackend::new())).expect("open");
    let (results, tracker) = collect_results();

    topic
        .submit_tracked(put("form", "title", json!("draft")), tracker())
        .expect("submit");

    assert_eq!(*results.lock().unwrap(), vec![ChangeResult::Accepted]);
    let value = topic.read(|data| data.map_entry("form", "title").map(|e| e.data.clone()));
    assert_eq!(value, Some(json!("draft")));
}

#[test]
fn first_node_becomes_leader_for_its_topic() {
    let topic = Topic::open("doc", Arc::new(LocalBackend::new())).expect("open");
    assert!(topic.is_leader());
    assert_eq!(
        topic.read(TopicData::leader_node),
        Some(topic.local_node())
    );
}

#[test]
fn concurrent_replace_accepts_exactly_one() {
    let hub = LogHub::new();
    let t1 = Topic::open("doc", Arc::new(LocalBackend::attached_to(&hub))).expect("open t1");
    let t2 = Topic::open("doc", Arc::new(LocalBackend::attached_to(&hub))).expect("open t2");

    t1.submit(put("state", "counter", json!(0))).expect("seed");

    let (results, tracker) = collect_results();
    let replace = ChangeRecord::Replace {
        name: "state".into(),
        key: "counter".into(),
        expected_value: json!(0),
        value: json!(1),
    };
    t1.submit_tracked(replace.clone(), tracker()).expect("submit t1");
    t2.submit_tracked(replace, tracker()).expect("submit t2");

    let results = results.lock().unwrap();
    let accepted = results.iter().filter(|r| r.is_accepted()).count();
    assert_eq!(accepted, 1, "exactly one optimistic writer wins");
    assert_eq!(
        t2.read(|data| data.map_entry("state", "counter").unwrap().data.clone()),
        json!(1)
    );
}

#[test]
fn subscribers_get_catch_up_state_then_live_changes() {
    let topic = Topic::open("doc", Arc::new(LocalBackend::new())).expect("open");
    topic.submit(put("m", "existing", json!(1))).expect("seed");

    let caught_up = Arc::new(Mutex::new(Vec::new()));
    let live = Arc::new(Mutex::new(Vec::new()));

    let caught_up_sink = Arc::clone(&caught_up);
    let live_sink = Arc::clone(&live);
    let _registration = topic.subscribe(
        move |data| {
            let keys: Vec<String> = data.map("m").unwrap().keys().cloned().collect();
            caught_up_sink.lock().unwrap().extend(keys);
        },
        Box::new(move |_, details| {
            if let ChangeDetails::Map(change) = details {
                live_sink.lock().unwrap().push(change.key.clone());
            }
        }),
    );

    topic.submit(put("m", "late", json!(2))).expect("live change");

    assert_eq!(*caught_up.lock().unwrap(), vec!["existing".to_string()]);
    assert_eq!(*live.lock().unwrap(), vec!["late".to_string()]);
}

#[test]
fn panicking_subscriber_is_removed_without_blinding_others() {
    let topic = Topic::open("doc", Arc::new(LocalBackend::new())).expect("open");

    let _bad = topic.subscribe(
        |_| {},
        Box::new(|_, _| panic!("broken observer")),
    );
    let seen = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&seen);
    let _good = topic.subscribe(
        |_| {},
        Box::new(move |_, _| *sink.lock().unwrap() += 1),
    );

    topic.submit(put("m", "a", json!(1))).expect("first");
    topic.submit(put("m", "b", json!(2))).expect("second");

    assert_eq!(*seen.lock().unwrap(), 2, "surviving subscriber sees every change");
}

#[test]
fn leader_failover_sweeps_departed_nodes_scoped_entries() {
    let hub = LogHub::new();
    let b1 = Arc::new(LocalBackend::attached_to(&hub));
    let b2 = Arc::new(LocalBackend::attached_to(&hub));
    let n1 = b1.node_id();

    let t1 = Topic::open("doc", b1).expect("open t1");
    let t2 = Topic::open("doc", b2).expect("open t2");
    assert!(t1.is_leader());
    assert!(!t2.is_leader());

    // A connection-scoped cursor owned by node 1, plus a topic-scoped one.
    t1.submit(ChangeRecord::Put {
        name: "cursors".into(),
        key: "u1".into(),
        value: json!({"x": 1}),
        expected_id: None,
        expected_value: None,
        scope_owner: Some(n1),
    })
    .expect("scoped put");
    t1.submit(put("cursors", "keep", json!({"x": 2}))).expect("plain put");

    assert!(t2.read(|data| data.map_entry("cursors", "u1").is_some()));

    hub.drop_node(n1);

    assert!(t2.is_leader(), "survivor takes over leadership");
    assert!(
        t2.read(|data| data.map_entry("cursors", "u1").is_none()),
        "departed node's scoped entry is swept"
    );
    assert!(
        t2.read(|data| data.map_entry("cursors", "keep").is_some()),
        "topic-scoped entries survive"
    );
    assert_eq!(t2.read(|data| data.backend_nodes().to_vec()), vec![t2.local_node()]);
}

#[test]
fn leader_snapshots_and_late_node_restores_identical_state() {
    let hub = LogHub::new();
    let backend = Arc::new(LocalBackend::attached_to(&hub));
    let t1 = Topic::open("doc", Arc::clone(&backend) as Arc<dyn Backend>).expect("open t1");

    for i in 0..250 {
        t1.submit(put("m", &format!("k{i}"), json!(i))).expect("put");
    }

    let snapshot_blob = backend
        .load_latest_snapshot("doc")
        .expect("load")
        .expect("leader must have submitted snapshots");
    let snapshot = TopicSnapshot::decode(&snapshot_blob).expect("decode");
    assert!(snapshot.latest.is_some());

    let t2 = Topic::open("doc", Arc::new(LocalBackend::attached_to(&hub))).expect("late join");
    let first = t1.read(|data| data.maps.clone());
    let second = t2.read(|data| data.maps.clone());
    assert_eq!(first, second, "late node converges through snapshot + tail");
}

#[test]
fn idle_expiration_prunes_on_reactivation() {
    let topic = Topic::open("doc", Arc::new(LocalBackend::new())).expect("open");
    let node = topic.local_node();

    topic
        .submit(ChangeRecord::ListTimeout {
            name: "chat".into(),
            value: Some(Duration::ZERO),
        })
        .expect("timeout");
    topic
        .submit(ChangeRecord::NodeActivate { node_id: node })
        .expect("activate");
    topic
        .submit(insert_last("chat", ListKey::random(), json!("hello")))
        .expect("insert");
    topic
        .submit(ChangeRecord::NodeDeactivate { node_id: node })
        .expect("deactivate");

    // Zero timeout expires immediately once idle; the next activation edge
    // prunes before anything else observes the list.
    topic
        .submit(ChangeRecord::NodeActivate { node_id: node })
        .expect("reactivate");

    assert_eq!(topic.read(|data| list_values(data, "chat")), Vec::<Value>::new());
}

#[test]
fn untimed_collections_survive_idle_periods() {
    let topic = Topic::open("doc", Arc::new(LocalBackend::new())).expect("open");
    let node = topic.local_node();

    topic.submit(ChangeRecord::NodeActivate { node_id: node }).expect("activate");
    topic.submit(put("m", "k", json!(1))).expect("put");
    topic.submit(ChangeRecord::NodeDeactivate { node_id: node }).expect("deactivate");
    topic.submit(ChangeRecord::NodeActivate { node_id: node }).expect("reactivate");

    assert!(topic.read(|data| data.map_entry("m", "k").is_some()));
}
