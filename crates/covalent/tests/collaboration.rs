//! End-to-end collaboration scenarios across engines sharing one hub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use covalent::{
    Backend, ConnectionHandle, Engine, EntryScope, ListKey, LocalBackend, LogHub, MapChangeEvent,
    TopicConnection, UserInfo,
};
use serde_json::{Value, json};

fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached in time");
}

/// Short settle window for asserting that nothing else arrives.
fn settle() {
    std::thread::sleep(Duration::from_millis(30));
}

/// Opens a connection through the engine's system context and waits for
/// activation.
fn open_active(engine: &Engine, topic: &str, user: &str) -> (ConnectionHandle, Arc<TopicConnection>) {
    let slot: Arc<Mutex<Option<Arc<TopicConnection>>>> = Arc::new(Mutex::new(None));
    let filler = Arc::clone(&slot);
    let context = engine.system_context();
    let handle = engine.open_topic_connection(
        context.as_ref(),
        topic,
        UserInfo::new(user),
        move |connection| {
            *filler.lock().unwrap() = Some(Arc::clone(connection));
        },
    );
    wait_until(|| slot.lock().unwrap().is_some());
    let connection = slot.lock().unwrap().clone().expect("activated");
    (handle, connection)
}

fn collect_map_events(
    events: &Arc<Mutex<Vec<(String, Value)>>>,
) -> impl FnMut(&MapChangeEvent) + Send + use<> {
    let sink = Arc::clone(events);
    move |event: &MapChangeEvent| {
        sink.lock().unwrap().push((event.key.clone(), event.value.clone()));
    }
}

#[test]
fn basic_collaboration_late_subscriber_sees_current_state_only() {
    let hub = LogHub::new();
    let engine_a = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine a");
    let engine_b = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine b");

    let (_handle_a, conn_a) = open_active(&engine_a, "t", "alice");
    conn_a.named_map("fields").put("name", "foo").wait();

    let (_handle_b, conn_b) = open_active(&engine_b, "t", "bob");
    let events = Arc::new(Mutex::new(Vec::new()));
    let _subscription = conn_b.named_map("fields").subscribe(collect_map_events(&events));

    wait_until(|| !events.lock().unwrap().is_empty());
    settle();
    assert_eq!(
        *events.lock().unwrap(),
        vec![("name".to_string(), json!("foo"))],
        "exactly one synthetic event for the current state, nothing else"
    );
}

#[test]
fn optimistic_concurrency_exactly_one_replace_wins() {
    let hub = LogHub::new();
    let engine_a = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine a");
    let engine_b = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine b");

    let (_handle_a, conn_a) = open_active(&engine_a, "t", "alice");
    let (_handle_b, conn_b) = open_active(&engine_b, "t", "bob");

    conn_a.named_map("state").put("counter", 0).wait();
    wait_until(|| {
        conn_b.named_map("state").get_value("counter") == Some(json!(0))
    });

    // Both read 0, both try 0 -> 1.
    let first = conn_a.named_map("state").replace("counter", 0, 1);
    let second = conn_b.named_map("state").replace("counter", 0, 1);
    let outcomes = [first.wait(), second.wait()];

    assert_eq!(outcomes.iter().filter(|accepted| **accepted).count(), 1);
    assert_eq!(conn_a.named_map("state").get_value("counter"), Some(json!(1)));
    assert_eq!(conn_b.named_map("state").get_value("counter"), Some(json!(1)));
}

#[test]
fn connection_scoped_entry_is_removed_on_deactivation() {
    let hub = LogHub::new();
    let engine_a = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine a");
    let engine_b = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine b");

    let (handle_a, conn_a) = open_active(&engine_a, "t", "alice");
    let (_handle_b, conn_b) = open_active(&engine_b, "t", "bob");

    conn_a
        .named_map("cursors")
        .put_with_scope("alice", json!({"x": 1}), EntryScope::Connection)
        .wait();

    let events = Arc::new(Mutex::new(Vec::new()));
    let _subscription = conn_b.named_map("cursors").subscribe(collect_map_events(&events));
    wait_until(|| !events.lock().unwrap().is_empty());

    handle_a.remove();

    // B observes the compensating removal.
    wait_until(|| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|(key, value)| key == "alice" && value.is_null())
    });
    assert_eq!(conn_b.named_map("cursors").get_value("alice"), None);
}

#[test]
fn leader_failover_sweeps_the_dead_nodes_state() {
    let hub = LogHub::new();
    let backend_a = Arc::new(LocalBackend::attached_to(&hub));
    let node_a = backend_a.node_id();
    let engine_a = Engine::new(backend_a).expect("engine a");
    let engine_b = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine b");

    let (_handle_a, conn_a) = open_active(&engine_a, "t", "alice");
    let (_handle_b, conn_b) = open_active(&engine_b, "t", "bob");

    conn_a
        .named_map("cursors")
        .put_with_scope("alice", json!({"x": 1}), EntryScope::Connection)
        .wait();
    wait_until(|| conn_b.named_map("cursors").get_value("alice").is_some());
    assert!(conn_a.topic().is_leader());

    // Node A crashes; the failure detector reports it.
    hub.drop_node(node_a);

    wait_until(|| conn_b.topic().is_leader());
    wait_until(|| conn_b.named_map("cursors").get_value("alice").is_none());
    assert_eq!(
        conn_b.topic().read(|data| data.backend_nodes().to_vec()),
        vec![conn_b.topic().local_node()]
    );
}

#[test]
fn snapshots_let_a_late_node_catch_up_without_the_full_log() {
    let hub = LogHub::new();
    let backend_a = Arc::new(LocalBackend::attached_to(&hub));
    let engine_a = Engine::new(Arc::clone(&backend_a) as Arc<dyn Backend>).expect("engine a");

    let (_handle_a, conn_a) = open_active(&engine_a, "t", "alice");
    let map = conn_a.named_map("m");
    let mut last = None;
    for i in 0..250 {
        last = Some(map.put(&format!("k{i}"), i));
    }
    last.expect("puts issued").wait();

    // The leader has snapshotted at least twice by now.
    let blob = backend_a
        .load_latest_snapshot("t")
        .expect("snapshot load")
        .expect("snapshot present");
    assert!(!blob.is_empty());

    let engine_c = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine c");
    let (_handle_c, conn_c) = open_active(&engine_c, "t", "carol");

    wait_until(|| conn_c.named_map("m").keys().len() == 250);
    for i in [0usize, 99, 249] {
        assert_eq!(
            conn_c.named_map("m").get_value(&format!("k{i}")),
            Some(json!(i))
        );
    }
}

#[test]
fn idle_expiration_clears_timed_out_collections_before_resubscribe() {
    let hub = LogHub::new();
    let engine = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine");

    let (handle_a, conn_a) = open_active(&engine, "t", "alice");
    let chat = conn_a.named_list("chat");
    chat.set_expiration_timeout(Some(Duration::ZERO)).wait();
    chat.insert_last("hello").completion.wait();
    assert_eq!(chat.values(), vec![json!("hello")]);
    let topic = Arc::clone(conn_a.topic());

    handle_a.remove();
    wait_until(|| topic.read(|data| data.active_nodes().count() == 0));

    // Zero timeout: expired the moment the topic went idle. The next
    // activation prunes before delivering any subscription state.
    let (_handle_b, conn_b) = open_active(&engine, "t", "bob");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _subscription = conn_b.named_list("chat").subscribe(move |event| {
        sink.lock().unwrap().push(event.clone());
    });

    settle();
    assert!(
        events.lock().unwrap().is_empty(),
        "no catch-up events: the expired list was pruned before resubscribe"
    );
    assert!(conn_b.named_list("chat").values().is_empty());
}

#[test]
fn list_ordering_is_shared_across_engines() {
    let hub = LogHub::new();
    let engine_a = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine a");
    let engine_b = Engine::new(Arc::new(LocalBackend::attached_to(&hub))).expect("engine b");

    let (_handle_a, conn_a) = open_active(&engine_a, "t", "alice");
    let (_handle_b, conn_b) = open_active(&engine_b, "t", "bob");

    let list_a = conn_a.named_list("tasks");
    let first = list_a.insert_last("one");
    let second = list_a.insert_last("two");
    second.completion.wait();

    // B inserts between A's two entries, conditional on adjacency.
    let list_b = conn_b.named_list("tasks");
    wait_until(|| list_b.keys().len() == 2);
    let between = list_b.insert_between(Some(first.key), Some(second.key), "one-and-a-half");
    assert!(between.completion.wait());

    // The same adjacency no longer holds.
    let stale = list_b.insert_between(Some(first.key), Some(second.key), "nope");
    assert!(!stale.completion.wait());

    wait_until(|| list_a.values().len() == 3);
    assert_eq!(
        list_a.values(),
        vec![json!("one"), json!("one-and-a-half"), json!("two")]
    );

    // Reorder and verify on the other side.
    assert!(list_b.move_before(first.key, second.key).wait());
    wait_until(|| list_a.values()[0] == json!("two"));
    let keys: Vec<ListKey> = list_a.keys();
    assert_eq!(keys.len(), 3);
}
