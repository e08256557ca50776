use crate::harness::World;
use coval_core::{keys, CoKind, ReadOptions};
use serde_json::json;

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
fn test_memoized_reads_are_shared_until_invalidation() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "memo", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let co_id = coval_core::CoId::parse(&id).unwrap();

    let first = world
        .engine
        .read_co_value(&id, None, &Default::default());
    let a = world.ready(&first);

    // The projection is memoized under (coId, options).
    let opts_key = ReadOptions::default().options_key();
    assert_eq!(
        world.engine.cache().get_resolved_data(&co_id, &opts_key),
        Some(a.clone())
    );

    let second = world
        .engine
        .read_co_value(&id, None, &Default::default());
    assert_eq!(world.ready(&second), a);

    // Mutation invalidates: a fresh read sees the new value.
    world
        .engine
        .update("todo", &id, json!({"text": "fresh"}))
        .unwrap();
    assert!(world
        .engine
        .cache()
        .get_resolved_data(&co_id, &opts_key)
        .is_none());
    let third = world
        .engine
        .read_co_value(&id, None, &Default::default());
    assert_eq!(world.ready(&third)["text"], json!("fresh"));
}

#[test]
fn test_distinct_options_memoize_separately() {
    let world = World::new();
    let child = world.peer.deliver(None, CoKind::Map, json!({"n": 1}));
    let record = world
        .peer
        .deliver(None, CoKind::Map, json!({"child": child.as_str()}));

    let deep = world
        .engine
        .read_co_value(record.as_str(), None, &Default::default());
    world.engine.settle();
    assert!(world.ready(&deep)["child"].is_object());

    let mut shallow_opts = ReadOptions::default();
    shallow_opts.deep_resolve = false;
    let shallow = world
        .engine
        .read_co_value(record.as_str(), None, &shallow_opts);
    assert_eq!(world.ready(&shallow)["child"], json!(child.as_str()));
}

#[test]
fn test_store_cleanup_waits_for_grace_period() {
    let (world, schema) = todo_world();
    world
        .engine
        .create("todo", json!({"text": "keep", "done": false}), None)
        .unwrap();

    let opts = ReadOptions::default();
    let store_key = keys::store(&schema, &json!({}).to_string(), &opts.options_key());

    let collection = world.engine.read_collection("todo", None, &opts);
    world.items(&collection);
    assert!(world.engine.cache().contains(&store_key));

    let sub = collection.subscribe(|_| {});
    sub.unsubscribe();

    // Before the grace period elapses the entry survives.
    world.clock.advance_ms(1_000);
    world.engine.tick();
    assert!(world.engine.cache().contains(&store_key));

    // After the grace period it is evicted.
    world.clock.advance_ms(
        world.engine.config().cleanup.grace_ms + 1,
    );
    world.engine.tick();
    assert!(!world.engine.cache().contains(&store_key));

    // A later read rebuilds the store from scratch, fully populated.
    let rebuilt = world.engine.read_collection("todo", None, &opts);
    assert_eq!(world.items(&rebuilt).len(), 1);
}

#[test]
fn test_quick_resubscribe_spares_the_store() {
    let (world, schema) = todo_world();
    let opts = ReadOptions::default();
    let store_key = keys::store(&schema, &json!({}).to_string(), &opts.options_key());

    let collection = world.engine.read_collection("todo", None, &opts);
    let first = collection.subscribe(|_| {});
    first.unsubscribe();

    // Resubscribed within the grace period: eviction is skipped.
    let _second = collection.subscribe(|_| {});
    world
        .clock
        .advance_ms(world.engine.config().cleanup.grace_ms + 1);
    world.engine.tick();
    assert!(world.engine.cache().contains(&store_key));
}

#[test]
fn test_resolved_flag_lifecycle() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "flag", "done": false}), None)
        .unwrap();
    let id = coval_core::CoId::parse(created["id"].as_str().unwrap()).unwrap();

    let store = world
        .engine
        .read_co_value(id.as_str(), None, &Default::default());
    world.ready(&store);
    assert!(world.engine.cache().is_resolved(&id));

    world
        .engine
        .update("todo", id.as_str(), json!({"done": true}))
        .unwrap();
    assert!(!world.engine.cache().is_resolved(&id));
}
