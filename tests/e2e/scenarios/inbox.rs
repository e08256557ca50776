use crate::harness::World;
use coval_core::{CoId, CovalError, Peer};
use serde_json::json;

/// Registers the event message schema and builds an inbox stream whose
/// items reference it.
fn inbox_world() -> (World, CoId) {
    let world = World::new();
    world.register_map_schema(
        "event",
        json!({"type": {"type": "string"}, "processed": {"type": "boolean"}}),
        false,
    );
    let inbox_schema = world.register_stream_schema("inbox", "event");
    let inbox = world.make_inbox(&inbox_schema);
    (world, inbox)
}

#[test]
fn test_message_is_delivered_exactly_once() {
    let (world, inbox) = inbox_world();
    world
        .engine
        .create_and_push_message(inbox.as_str(), json!({"type": "PING", "payload": {"n": 1}}))
        .unwrap();

    let first = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    let messages = first["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], json!("PING"));
    assert_eq!(messages[0]["payload"]["n"], json!(1));
    assert!(messages[0]["_coId"].as_str().unwrap().starts_with("co_z"));
    assert!(messages[0]["_sessionID"].is_string());
    assert!(messages[0]["_madeAt"].is_i64());
    // Internal bookkeeping never reaches the caller.
    assert!(messages[0].get("processed").is_none());
    assert!(messages[0].get("$schema").is_none());

    let second = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    assert!(second["messages"].as_array().unwrap().is_empty());
}

#[test]
fn test_concurrent_processors_converge() {
    let (world, inbox) = inbox_world();
    world
        .engine
        .create_and_push_message(inbox.as_str(), json!({"type": "PING", "payload": {}}))
        .unwrap();

    // Two actors drain the same inbox; the processed mark is idempotent,
    // so the message is delivered once in total.
    let a = world.engine.process_inbox("actor-a", inbox.as_str()).unwrap();
    let b = world.engine.process_inbox("actor-b", inbox.as_str()).unwrap();
    let delivered =
        a["messages"].as_array().unwrap().len() + b["messages"].as_array().unwrap().len();
    assert_eq!(delivered, 1);
}

#[test]
fn test_messages_sorted_by_made_at() {
    let (world, inbox) = inbox_world();
    world
        .engine
        .create_and_push_message(inbox.as_str(), json!({"type": "FIRST", "payload": {}}))
        .unwrap();
    world.clock.advance_ms(10);
    world
        .engine
        .create_and_push_message(inbox.as_str(), json!({"type": "SECOND", "payload": {}}))
        .unwrap();

    let result = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    let messages = result["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["type"], json!("FIRST"));
    assert_eq!(messages[1]["type"], json!("SECOND"));
    assert!(messages[0]["_madeAt"].as_i64() < messages[1]["_madeAt"].as_i64());
}

#[test]
fn test_unresolved_expressions_are_rejected() {
    let (world, inbox) = inbox_world();
    let err = world
        .engine
        .create_and_push_message(
            inbox.as_str(),
            json!({"type": "PING", "payload": {"text": "{{item.name}}"}}),
        )
        .unwrap_err();
    assert!(matches!(err, CovalError::ExpressionUnresolved(_)));

    // Nothing was pushed.
    let result = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    assert!(result["messages"].as_array().unwrap().is_empty());
}

#[test]
fn test_system_messages_are_skipped() {
    let (world, inbox) = inbox_world();
    // Inline system markers never reach delivery.
    world
        .engine
        .push_item(inbox.as_str(), json!({"type": "INIT"}))
        .unwrap();
    world
        .engine
        .push_item(inbox.as_str(), json!({"from": "system", "_coId": "co_zSys1"}))
        .unwrap();

    let result = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    assert!(result["messages"].as_array().unwrap().is_empty());
}

#[test]
fn test_messages_without_type_are_skipped() {
    let (world, inbox) = inbox_world();
    world
        .engine
        .create_and_push_message(inbox.as_str(), json!({"payload": {"n": 1}}))
        .unwrap();

    let result = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    assert!(result["messages"].as_array().unwrap().is_empty());
}

#[test]
fn test_remove_member_requires_member_reference() {
    let (world, inbox) = inbox_world();
    world
        .engine
        .create_and_push_message(
            inbox.as_str(),
            json!({"type": "REMOVE_MEMBER", "payload": {"memberId": "not-a-ref"}}),
        )
        .unwrap();
    world
        .engine
        .create_and_push_message(
            inbox.as_str(),
            json!({"type": "REMOVE_MEMBER", "payload": {"memberId": "co_zMember1"}}),
        )
        .unwrap();

    let result = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    let messages = result["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["payload"]["memberId"], json!("co_zMember1"));
}

#[test]
fn test_message_defaults_processed_false() {
    let (world, inbox) = inbox_world();
    let record = world
        .engine
        .create_and_push_message(inbox.as_str(), json!({"type": "PING", "payload": {}}))
        .unwrap();
    assert_eq!(record["processed"], json!(false));
}

#[test]
fn test_processed_mark_survives_in_the_record() {
    let (world, inbox) = inbox_world();
    let record = world
        .engine
        .create_and_push_message(inbox.as_str(), json!({"type": "PING", "payload": {}}))
        .unwrap();
    let id = record["id"].as_str().unwrap().to_string();

    world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();

    let co_id = CoId::parse(&id).unwrap();
    assert_eq!(
        world.peer.entry(&co_id).get("processed"),
        Some(json!(true))
    );
}

#[test]
fn test_legacy_inline_objects_rejected_silently() {
    let (world, inbox) = inbox_world();
    world
        .engine
        .push_item(inbox.as_str(), json!({"type": "PING", "payload": {"n": 1}}))
        .unwrap();

    let result = world
        .engine
        .process_inbox("actor-1", inbox.as_str())
        .unwrap();
    assert!(result["messages"].as_array().unwrap().is_empty());
}
