use crate::harness::World;
use coval_core::{CoHeader, CoId, CoKind, CovalError, Peer, ReadState};
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
fn test_create_then_read_single_and_collection() {
    let (world, schema) = todo_world();

    let created = world
        .engine
        .create("todo", json!({"text": "hi", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("co_z"));
    assert_eq!(created["text"], json!("hi"));
    assert_eq!(created["done"], json!(false));
    assert_eq!(created["$schema"], json!(schema.as_str()));

    // Content-addressed identity: value.id equals the requested co-id and
    // $schema matches the header.
    let store = world.engine.read_co_value(&id, None, &Default::default());
    let value = world.ready(&store);
    assert_eq!(value["id"], json!(id));
    assert_eq!(value["$schema"], json!(schema.as_str()));

    // An immediate collection read eventually contains the new record.
    let collection = world.engine.read_collection("todo", None, &Default::default());
    let items = world.items(&collection);
    assert!(items.iter().any(|item| item["id"] == json!(id)));
}

#[test]
fn test_update_emits_new_value_and_never_the_old_one_again() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "hi", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let store = world.engine.read_co_value(&id, None, &Default::default());
    world.ready(&store);

    let seen: Rc<RefCell<Vec<serde_json::Value>>> = Rc::new(RefCell::new(vec![]));
    let sink = Rc::clone(&seen);
    let _sub = store.subscribe(move |state: &ReadState| {
        if let Some(value) = state.value() {
            sink.borrow_mut().push(value["done"].clone());
        }
    });

    world
        .engine
        .update("todo", &id, json!({"done": true}))
        .unwrap();
    world.engine.settle();

    let seen = seen.borrow();
    assert!(seen.contains(&json!(true)));
    // Once done=true was observed, done=false never reappears.
    let first_true = seen.iter().position(|v| v == &json!(true)).unwrap();
    assert!(seen[first_true..].iter().all(|v| v == &json!(true)));
    assert_eq!(world.ready(&store)["done"], json!(true));
}

#[test]
fn test_update_rejects_schema_violation_before_mutation() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "hi", "done": true}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let err = world
        .engine
        .update("todo", &id, json!({"done": "yes"}))
        .unwrap_err();
    assert!(matches!(err, CovalError::ValidationFailure { .. }));

    // The record is untouched.
    let store = world.engine.read_co_value(&id, None, &Default::default());
    assert_eq!(world.ready(&store)["done"], json!(true));
}

#[test]
fn test_update_derives_schema_from_header_not_caller() {
    let (world, _) = todo_world();
    world.register_map_schema("loose", json!({}), false);
    let created = world
        .engine
        .create("todo", json!({"text": "hi", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    // The caller names a permissive schema, but the header's schema wins.
    let err = world
        .engine
        .update("loose", &id, json!({"done": 3}))
        .unwrap_err();
    assert!(matches!(err, CovalError::ValidationFailure { .. }));
}

#[test]
fn test_update_skips_validation_for_system_spark_records() {
    let system = CoId::parse("co_zSystemSpark1").unwrap();
    let world = World::with_system_spark(&system);
    world.register_map_schema(
        "todo",
        json!({"text": {"type": "string"}, "done": {"type": "boolean"}}),
        true,
    );

    let created = world
        .engine
        .create(
            "todo",
            json!({"text": "sys", "done": false}),
            Some(system.clone()),
        )
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    // The same payload a plain record rejects goes through untouched.
    let updated = world
        .engine
        .update("todo", &id, json!({"done": "yes"}))
        .unwrap();
    assert_eq!(updated["done"], json!("yes"));

    // A record of the same schema without the attribution still validates.
    let plain = world
        .engine
        .create("todo", json!({"text": "plain", "done": false}), None)
        .unwrap();
    let plain_id = plain["id"].as_str().unwrap().to_string();
    let err = world
        .engine
        .update("todo", &plain_id, json!({"done": "yes"}))
        .unwrap_err();
    assert!(matches!(err, CovalError::ValidationFailure { .. }));
}

#[test]
fn test_update_skips_validation_for_account_and_group_records() {
    let (world, _) = todo_world();

    // A group-ruleset record carries no header schema; its updates bypass
    // the gate's validation entirely.
    let group = world.peer.deliver_with_header(
        CoHeader {
            kind: CoKind::Map,
            schema: None,
            type_hint: None,
            ruleset: Some("group".to_string()),
            spark: None,
            sealed: vec![],
            created_at: world.clock.now_ms(),
        },
        json!({"accountMembers": []}),
    );
    let updated = world
        .engine
        .update("todo", group.as_str(), json!({"accountMembers": ["a"]}))
        .unwrap();
    assert_eq!(updated["$schema"], json!(coval_core::GROUP_MARKER));
    assert_eq!(updated["accountMembers"], json!(["a"]));

    // The account root updates just as freely.
    let account = world.peer.account();
    let updated = world
        .engine
        .update("todo", account.as_str(), json!({"nickname": "me"}))
        .unwrap();
    assert_eq!(updated["$schema"], json!(coval_core::ACCOUNT_MARKER));
    assert_eq!(updated["nickname"], json!("me"));
}

#[test]
fn test_toggle_flips_booleans_only() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "hi", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let toggled = world.engine.toggle("todo", &id, "done").unwrap();
    assert_eq!(toggled["done"], json!(true));

    let err = world.engine.toggle("todo", &id, "text").unwrap_err();
    assert!(matches!(err, CovalError::ValidationFailure { .. }));
}

#[test]
fn test_delete_removes_record_and_index_entry() {
    let (world, _) = todo_world();
    let created = world
        .engine
        .create("todo", json!({"text": "bye", "done": false}), None)
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    world.engine.delete("todo", &id).unwrap();
    world.engine.settle();

    let collection = world.engine.read_collection("todo", None, &Default::default());
    let items = world.items(&collection);
    assert!(items.iter().all(|item| item["id"] != json!(id)));
}

#[test]
fn test_find_first_matches_and_misses() {
    let (world, _) = todo_world();
    world
        .engine
        .create("todo", json!({"text": "a", "done": false}), None)
        .unwrap();
    world
        .engine
        .create("todo", json!({"text": "b", "done": true}), None)
        .unwrap();
    world.engine.settle();

    let hit = world
        .engine
        .find_first("todo", &json!({"done": true}))
        .unwrap()
        .unwrap();
    assert_eq!(hit["text"], json!("b"));

    let miss = world
        .engine
        .find_first("todo", &json!({"text": "zzz"}))
        .unwrap();
    assert!(miss.is_none());
}

#[test]
fn test_update_on_colist_is_unsupported() {
    let (world, _) = todo_world();
    let list = world
        .peer
        .deliver(None, coval_core::CoKind::List, json!(["x"]));
    let err = world
        .engine
        .update("todo", list.as_str(), json!({"a": 1}))
        .unwrap_err();
    assert!(matches!(err, CovalError::UnsupportedOperation { .. }));
}

#[test]
fn test_gate_envelope_success_and_failure() {
    let (world, _) = todo_world();

    let created = world.engine.execute(&json!({
        "op": "create",
        "schema": "todo",
        "data": {"text": "via gate", "done": false},
    }));
    assert_eq!(created["ok"], json!(true));
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let read = world.engine.execute(&json!({"op": "read", "coId": id}));
    assert_eq!(read["ok"], json!(true));
    assert_eq!(read["data"]["text"], json!("via gate"));

    let bad = world.engine.execute(&json!({
        "op": "update",
        "schema": "todo",
        "id": id,
        "data": {"done": "yes"},
    }));
    assert_eq!(bad["ok"], json!(false));
    assert!(bad["errors"][0]["message"].as_str().unwrap().contains("done"));

    let unknown = world.engine.execute(&json!({"op": "explode"}));
    assert_eq!(unknown["ok"], json!(false));
}

#[test]
fn test_gate_resolve_and_schema_ops() {
    let (world, schema) = todo_world();

    let resolved = world
        .engine
        .execute(&json!({"op": "resolve", "humanReadableKey": "°Maia/schema/todo"}));
    assert_eq!(resolved["data"], json!(schema.as_str()));

    let doc = world
        .engine
        .execute(&json!({"op": "schema", "schemaName": "todo"}));
    assert_eq!(doc["ok"], json!(true));
    assert_eq!(doc["data"]["$id"], json!(schema.as_str()));
}

#[test]
fn test_gate_load_binary_as_blob() {
    let (world, _) = todo_world();
    let binary = world.peer.put_binary("text/plain", b"hello".to_vec());

    let blob = world
        .engine
        .execute(&json!({"op": "loadBinaryAsBlob", "coId": binary.as_str()}));
    assert_eq!(blob["ok"], json!(true));
    assert_eq!(
        blob["data"]["dataUrl"],
        json!("data:text/plain;base64,aGVsbG8=")
    );
}

#[test]
fn test_create_infers_cotype_and_rejects_strings() {
    let world = World::new();
    // A schema without a declared cotype: the data shape decides.
    world
        .schemas
        .register("free", coval_core::SchemaDoc::named("free"));

    let from_object = world.engine.create("free", json!({"a": 1}), None).unwrap();
    assert!(from_object["id"].as_str().unwrap().starts_with("co_z"));

    let err = world
        .engine
        .create("free", json!("just a string"), None)
        .unwrap_err();
    assert!(matches!(err, CovalError::UnsupportedOperation { .. }));
}

#[test]
fn test_push_appends_to_stream_only() {
    let (world, _) = todo_world();
    let stream = world
        .peer
        .deliver(None, coval_core::CoKind::Stream, json!([]));
    world.engine.push_item(stream.as_str(), json!("co_zItem1")).unwrap();

    let map = world.peer.deliver(None, coval_core::CoKind::Map, json!({}));
    let err = world
        .engine
        .push_item(map.as_str(), json!("x"))
        .unwrap_err();
    assert!(matches!(err, CovalError::UnsupportedOperation { .. }));
}
