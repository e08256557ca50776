use crate::harness::World;
use coval_core::{CoKind, Peer, ReadRequest};
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
fn test_filter_is_strict_equality() {
    let (world, _) = todo_world();
    world
        .engine
        .create("todo", json!({"text": "open", "done": false}), None)
        .unwrap();
    world
        .engine
        .create("todo", json!({"text": "closed", "done": true}), None)
        .unwrap();

    let open = world
        .engine
        .read_collection("todo", Some(json!({"done": false})), &Default::default());
    let items = world.items(&open);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["text"], json!("open"));

    // No coercion: a string never matches a boolean.
    let coerced = world
        .engine
        .read_collection("todo", Some(json!({"done": "false"})), &Default::default());
    assert!(world.items(&coerced).is_empty());
}

#[test]
fn test_empty_skeletons_are_suppressed() {
    let (world, schema) = todo_world();
    world
        .engine
        .create("todo", json!({"text": "real", "done": false}), None)
        .unwrap();
    // A replicated skeleton: schema header but no content keys yet.
    world.peer.deliver(Some(schema), CoKind::Map, json!({}));
    world.engine.settle();

    let collection = world.engine.read_collection("todo", None, &Default::default());
    let items = world.items(&collection);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["text"], json!("real"));
}

#[test]
fn test_duplicate_index_entries_emit_once() {
    let (world, schema) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "solo", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    world.engine.settle();

    // Replication race: the same co-id lands in the index twice.
    let list_id = world.index_list(&schema).unwrap();
    world
        .peer
        .entry(&list_id)
        .append(json!(id))
        .unwrap();

    let collection = world.engine.read_collection("todo", None, &Default::default());
    let items = world.items(&collection);
    assert_eq!(items.len(), 1);
}

#[test]
fn test_collection_grows_progressively_as_items_load() {
    let (world, schema) = todo_world();
    // A replicated record still in cold storage.
    let cold = world
        .peer
        .seed(Some(schema.clone()), CoKind::Map, json!({"text": "remote", "done": false}));

    // The first read creates the (empty) index list lazily.
    let collection = world.engine.read_collection("todo", None, &Default::default());
    assert!(world.items(&collection).is_empty());

    // A replicated index entry arrives for the cold record: the store
    // stays empty while the load is in flight.
    let list_id = world.index_list(&schema).unwrap();
    world
        .peer
        .entry(&list_id)
        .append(json!(cold.as_str()))
        .unwrap();
    assert!(collection.get().value().unwrap().as_array().unwrap().is_empty());

    world.engine.settle();
    let items = world.items(&collection);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["text"], json!("remote"));
}

#[test]
fn test_collection_updates_on_item_mutation() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "v1", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let collection = world.engine.read_collection("todo", None, &Default::default());
    assert_eq!(world.items(&collection)[0]["text"], json!("v1"));

    world
        .engine
        .update("todo", &id, json!({"text": "v2"}))
        .unwrap();
    world.engine.settle();
    assert_eq!(world.items(&collection)[0]["text"], json!("v2"));
}

#[test]
fn test_unresolvable_schema_yields_error_store() {
    let (world, _) = todo_world();
    let store = world
        .engine
        .read_collection("no-such-schema", None, &Default::default());
    assert!(matches!(store.get(), coval_core::ReadState::Error { .. }));
}

#[test]
fn test_non_indexable_schema_reads_empty() {
    let world = World::new();
    world.register_map_schema("note", json!({}), false);
    let store = world.engine.read_collection("note", None, &Default::default());
    assert!(world.items(&store).is_empty());
}

#[test]
fn test_read_all_includes_records_and_honors_filter() {
    let (world, _) = todo_world();
    world
        .engine
        .create("todo", json!({"text": "a", "done": false}), None)
        .unwrap();
    world
        .engine
        .create("todo", json!({"text": "b", "done": true}), None)
        .unwrap();

    let all = world.engine.read_all(Some(json!({"done": true})), &Default::default());
    let items = world.items(&all);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["text"], json!("b"));
}

#[test]
fn test_read_all_sees_later_creates() {
    let (world, _) = todo_world();
    let all = world.engine.read_all(Some(json!({"text": "late"})), &Default::default());
    assert!(world.items(&all).is_empty());

    world
        .engine
        .create("todo", json!({"text": "late", "done": false}), None)
        .unwrap();
    world.engine.settle();
    assert_eq!(world.items(&all).len(), 1);
}

#[test]
fn test_registry_read_serves_sparks() {
    let (world, _) = todo_world();

    // account.registries.sparks maps names to spark records.
    let spark = world
        .peer
        .deliver(None, CoKind::Map, json!({"name": "helper", "kind": "spark"}));
    let sparks = world
        .peer
        .deliver(None, CoKind::Map, json!({"helper": spark.as_str()}));
    let registries = world
        .peer
        .deliver(None, CoKind::Map, json!({"sparks": sparks.as_str()}));
    world
        .peer
        .entry(&world.peer.account())
        .set("registries", json!(registries.as_str()))
        .unwrap();

    let store = world.engine.read(ReadRequest {
        schema: Some("sparks".to_string()),
        ..Default::default()
    });
    let items = world.items(&store);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["name"], json!("helper"));
}
