use crate::harness::World;
use coval_core::{CoKind, Peer, ReadState};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

fn todo_world() -> (World, coval_core::CoId) {
    let world = World::new();
    let schema = world.register_map_schema(
        "todo",
        json!({"text": {"type": "string"}, "done": {"type": "boolean"}}),
        true,
    );
    (world, schema)
}

#[test]
fn test_read_transitions_to_error_offline_then_ready_on_reconnect() {
    let world = World::new();
    world.peer.set_offline(true);
    let cold = world
        .peer
        .seed(None, CoKind::Map, json!({"text": "remote"}));

    let store = world
        .engine
        .read_co_value(cold.as_str(), None, &Default::default());
    // Offline: the wait resolves without the value.
    assert!(matches!(store.get(), ReadState::Error { .. }));

    let states: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(vec![]));
    let sink = Rc::clone(&states);
    let _sub = store.subscribe(move |state: &ReadState| {
        sink.borrow_mut().push(state.is_loading());
    });

    world.peer.set_offline(false);
    world.engine.settle();

    let value = world.ready(&store);
    assert_eq!(value["text"], json!("remote"));
    // No spurious loading states after readiness.
    assert!(states.borrow().iter().all(|loading| !loading));
}

#[test]
fn test_unknown_id_stays_recoverable() {
    let world = World::new();
    let store = world
        .engine
        .read_co_value("co_zNowhere1", None, &Default::default());
    match store.get() {
        ReadState::Error { id, .. } => {
            assert_eq!(id.unwrap().as_str(), "co_zNowhere1");
        }
        other => panic!("expected error state, got {:?}", other.to_value()),
    }
}

#[test]
fn test_invalid_id_is_an_error_state_not_a_panic() {
    let world = World::new();
    let store = world
        .engine
        .read_co_value("definitely-not-a-co-id", None, &Default::default());
    assert!(matches!(store.get(), ReadState::Error { .. }));
}

#[test]
fn test_unified_store_merges_query_results() {
    let (world, _) = todo_world();
    world
        .engine
        .create("todo", json!({"text": "pending", "done": false}), None)
        .unwrap();

    let dashboard = world.peer.deliver(
        None,
        CoKind::Map,
        json!({
            "title": "board",
            "hasTodos": false,
            "todos": {"schema": "todo", "filter": {"done": false}},
        }),
    );

    let store = world
        .engine
        .read_co_value(dashboard.as_str(), None, &Default::default());
    let value = world.ready(&store);

    assert_eq!(value["title"], json!("board"));
    let todos = value["todos"].as_array().unwrap();
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0]["text"], json!("pending"));
    // Derived boolean and the $op echo of the query definition.
    assert_eq!(value["hasTodos"], json!(true));
    assert_eq!(value["$op"]["todos"]["schema"], json!("todo"));
}

#[test]
fn test_unified_store_batches_child_updates_into_one_emission() {
    let (world, _) = todo_world();
    let dashboard = world.peer.deliver(
        None,
        CoKind::Map,
        json!({"todos": {"schema": "todo", "filter": {"done": false}}}),
    );

    let store = world
        .engine
        .read_co_value(dashboard.as_str(), None, &Default::default());
    world.ready(&store);

    let emissions = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&emissions);
    let _sub = store.subscribe(move |_| *counter.borrow_mut() += 1);

    // Two child updates land before the queue drains.
    world
        .engine
        .create("todo", json!({"text": "a", "done": false}), None)
        .unwrap();
    world
        .engine
        .create("todo", json!({"text": "b", "done": false}), None)
        .unwrap();
    assert_eq!(*emissions.borrow(), 0);

    world.engine.settle();
    assert_eq!(*emissions.borrow(), 1);
    assert_eq!(
        world.ready(&store)["todos"].as_array().unwrap().len(),
        2
    );

    // JSON-equivalent updates are suppressed entirely.
    world.engine.settle();
    assert_eq!(*emissions.borrow(), 1);
}

#[test]
fn test_unified_store_find_one_shape() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "target", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap();

    let context = world.peer.deliver(
        None,
        CoKind::Map,
        json!({"detail": {"schema": "todo", "filter": {"id": id}}}),
    );
    let store = world
        .engine
        .read_co_value(context.as_str(), None, &Default::default());
    let value = world.ready(&store);
    assert_eq!(value["detail"]["text"], json!("target"));
}

#[test]
fn test_unified_store_unresolvable_schema_becomes_empty_array() {
    let world = World::new();
    let context = world.peer.deliver(
        None,
        CoKind::Map,
        json!({"ghosts": {"schema": "no-such-schema"}}),
    );
    let store = world
        .engine
        .read_co_value(context.as_str(), None, &Default::default());
    let value = world.ready(&store);
    assert_eq!(value["ghosts"], json!([]));
}

#[test]
fn test_collection_store_is_interned_per_key() {
    let (world, _) = todo_world();
    let a = world
        .engine
        .read_collection("todo", Some(json!({"done": false})), &Default::default());
    let b = world
        .engine
        .read_collection("todo", Some(json!({"done": false})), &Default::default());
    // Same logical identity: mutations through one are visible via the
    // other immediately.
    a.set(ReadState::Ready(json!(["sentinel"])));
    assert_eq!(b.get().value(), Some(&json!(["sentinel"])));
}

#[test]
fn test_resolve_schema_reactive_through_registry() {
    let world = World::new();
    let store = world.engine.resolve_schema_reactive("draft");
    assert!(store.get().loading);

    let schema_id = coval_core::CoId::parse("co_zDraftSchema1").unwrap();
    let registry = world
        .peer
        .deliver(None, CoKind::Map, json!({"draft": schema_id.as_str()}));
    world
        .peer
        .entry(&world.os)
        .set("schematas", json!(registry.as_str()))
        .unwrap();

    let resolved = store.get();
    assert!(!resolved.loading);
    assert_eq!(resolved.schema, Some(schema_id));
}
