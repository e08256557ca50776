use crate::harness::World;
use coval_core::{CoKind, Peer, ReadOptions};
use serde_json::json;

#[test]
fn test_map_resolves_only_along_traversal_paths() {
    let world = World::new();
    let group = world
        .peer
        .deliver(None, CoKind::Map, json!({"accountMembers": ["a", "b"]}));
    // A sibling reference that must never be materialized.
    let sibling = world
        .peer
        .seed(None, CoKind::Map, json!({"payload": "enormous"}));
    let record = world.peer.deliver(
        None,
        CoKind::Map,
        json!({"group": group.as_str(), "attachment": sibling.as_str(), "title": "t"}),
    );

    let mut opts = ReadOptions::default();
    opts.map = Some(
        json!({"members": "$group.accountMembers"})
            .as_object()
            .unwrap()
            .clone(),
    );
    let store = world.engine.read_co_value(record.as_str(), None, &opts);
    let value = world.ready(&store);

    assert_eq!(value["members"], json!(["a", "b"]));
    assert_eq!(value["title"], json!("t"));
    // The root reference property was consumed by the projection.
    assert!(value.get("group").is_none());
    // Nothing involving the sibling was loaded.
    assert!(!world.peer.entry(&sibling).is_available());
    assert_eq!(world.peer.pending_load_count(), 0);
}

#[test]
fn test_map_projection_updates_when_dependency_changes() {
    let world = World::new();
    let group = world
        .peer
        .deliver(None, CoKind::Map, json!({"accountMembers": ["a"]}));
    let record = world
        .peer
        .deliver(None, CoKind::Map, json!({"group": group.as_str()}));

    let mut opts = ReadOptions::default();
    opts.map = Some(
        json!({"members": "$group.accountMembers"})
            .as_object()
            .unwrap()
            .clone(),
    );
    let store = world.engine.read_co_value(record.as_str(), None, &opts);
    assert_eq!(world.ready(&store)["members"], json!(["a"]));

    world
        .peer
        .entry(&group)
        .set("accountMembers", json!(["a", "b"]))
        .unwrap();
    world.engine.settle();
    assert_eq!(world.ready(&store)["members"], json!(["a", "b"]));
}

#[test]
fn test_cycle_resolves_to_stub() {
    let world = World::new();
    let a = world.peer.deliver(None, CoKind::Map, json!({}));
    let b = world
        .peer
        .deliver(None, CoKind::Map, json!({"ref": a.as_str()}));
    world.peer.entry(&a).set("ref", json!(b.as_str())).unwrap();

    let mut opts = ReadOptions::default();
    opts.max_depth = 5;
    let store = world.engine.read_co_value(a.as_str(), None, &opts);
    let value = world.ready(&store);

    // A.ref is B expanded; B.ref collapses back to a stub of A.
    assert_eq!(value["ref"]["id"], json!(b.as_str()));
    assert_eq!(value["ref"]["ref"], json!({"id": a.as_str()}));
}

#[test]
fn test_deep_resolution_completes_when_reference_arrives() {
    let world = World::new();
    let cold = world
        .peer
        .seed(None, CoKind::Map, json!({"name": "late"}));
    let record = world
        .peer
        .deliver(None, CoKind::Map, json!({"child": cold.as_str()}));

    let store = world
        .engine
        .read_co_value(record.as_str(), None, &Default::default());
    // The root is ready immediately; the reference is still raw.
    assert_eq!(store.get().value().unwrap()["child"], json!(cold.as_str()));

    world.engine.settle();
    let value = world.ready(&store);
    assert_eq!(value["child"]["name"], json!("late"));
}

#[test]
fn test_depth_bound_is_honored() {
    let world = World::new();
    let leaf = world.peer.deliver(None, CoKind::Map, json!({"n": 1}));
    let mid = world
        .peer
        .deliver(None, CoKind::Map, json!({"leaf": leaf.as_str()}));
    let root = world
        .peer
        .deliver(None, CoKind::Map, json!({"mid": mid.as_str()}));

    let mut opts = ReadOptions::default();
    opts.max_depth = 1;
    let store = world.engine.read_co_value(root.as_str(), None, &opts);
    let value = world.ready(&store);

    assert_eq!(value["mid"]["leaf"], json!(leaf.as_str()));
}

#[test]
fn test_as_data_url_map_suffix() {
    let world = World::new();
    let binary = world.peer.put_binary("image/png", vec![1, 2, 3]);
    let record = world
        .peer
        .deliver(None, CoKind::Map, json!({"img": binary.as_str()}));

    let mut opts = ReadOptions::default();
    opts.map = Some(
        json!({"img": "$img:asDataUrl"})
            .as_object()
            .unwrap()
            .clone(),
    );
    let store = world.engine.read_co_value(record.as_str(), None, &opts);
    let value = world.ready(&store);
    assert!(value["img"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));
}

#[test]
fn test_no_deep_resolve_leaves_references_raw() {
    let world = World::new();
    let child = world.peer.deliver(None, CoKind::Map, json!({"n": 1}));
    let record = world
        .peer
        .deliver(None, CoKind::Map, json!({"child": child.as_str()}));

    let mut opts = ReadOptions::default();
    opts.deep_resolve = false;
    let store = world.engine.read_co_value(record.as_str(), None, &opts);
    let value = world.ready(&store);
    assert_eq!(value["child"], json!(child.as_str()));
}
