//! Coval Core Library
//!
//! A CRUD and reactive resolution engine for content-addressed co-values,
//! providing:
//! - Validated create/read/update/delete over a CRDT peer
//! - Progressive deep reference resolution with cycle safety
//! - Map-driven on-demand projection
//! - Reactive stores with process-wide interning and memoization
//! - Per-schema collection indexing and once-only inbox dispatch
//!
//! # Quick Start
//!
//! ```
//! use coval_core::{CoKind, Engine, MemoryPeer, SchemaDoc, StaticSchemas};
//! use serde_json::json;
//! use std::rc::Rc;
//!
//! let peer = MemoryPeer::new();
//! let os = peer.deliver(None, CoKind::Map, json!({}));
//! let schemas = StaticSchemas::new();
//! let mut doc = SchemaDoc::named("todo");
//! doc.cotype = Some(CoKind::Map);
//! schemas.register("todo", doc);
//!
//! let engine = Engine::new(Rc::new(peer), Rc::new(schemas), os);
//!
//! // Create a record and read it back reactively.
//! let created = engine.create("todo", json!({"text": "hi", "done": false}), None).unwrap();
//! let id = created["id"].as_str().unwrap();
//!
//! let store = engine.read_co_value(id, None, &Default::default());
//! assert_eq!(store.get().value().unwrap()["text"], json!("hi"));
//! ```
//!
//! # Reactivity
//!
//! Read paths never fail: they return a [`Store`] that transitions through
//! `Loading` to `Ready` or `Error` and keeps updating as the underlying
//! co-values change. Collections start empty and grow progressively:
//!
//! ```
//! use coval_core::{CoKind, Engine, MemoryPeer, SchemaDoc, StaticSchemas};
//! use serde_json::json;
//! use std::rc::Rc;
//!
//! let peer = MemoryPeer::new();
//! let os = peer.deliver(None, CoKind::Map, json!({}));
//! let schemas = StaticSchemas::new();
//! let mut doc = SchemaDoc::named("todo");
//! doc.cotype = Some(CoKind::Map);
//! doc.indexing = true;
//! schemas.register("todo", doc);
//! let engine = Engine::new(Rc::new(peer), Rc::new(schemas), os);
//!
//! let todos = engine.read_collection("todo", None, &Default::default());
//! engine.create("todo", json!({"text": "first"}), None).unwrap();
//! engine.settle();
//! assert_eq!(todos.get().value().unwrap().as_array().unwrap().len(), 1);
//! ```

mod cache;
mod co_id;
mod config;
mod deep;
mod engine;
mod error;
mod evaluator;
mod extract;
mod inbox;
mod index;
mod loader;
mod map_transform;
mod memory;
mod ops;
mod peer;
mod read;
mod reactive;
mod scheduler;
mod schema;
mod store;
mod unified;

pub use cache::{keys, ResolutionState, SubscriptionCache};
pub use co_id::CoId;
pub use config::{CleanupConfig, Config, InboxConfig, ReadConfig, RegistryConfig};
pub use engine::{Engine, WeakEngine};
pub use error::{CovalError, Result};
pub use evaluator::{Evaluator, LiteralEvaluator};
pub use extract::{
    classify_value, extract, extract_sessions, is_empty_skeleton, schema_attribution, ValueKind,
    SEALED_PLACEHOLDER,
};
pub use loader::CoValueLoader;
pub use map_transform::{apply_map, parse_map_expr, MapExpr, MapOutcome, DATA_URL_PLACEHOLDER};
pub use memory::MemoryPeer;
pub use peer::{
    BinaryBlob, CoContent, CoHandle, CoHeader, CoKind, CoState, CreateRequest, MapEntry, Peer,
    PeerCallback, PeerSubscription, StreamItem, ValidationHook, WriteEvent, WriteHook,
};
pub use read::{matches_filter, ReadOptions, ReadRequest};
pub use reactive::{CoValueResolve, QueryResolve, SchemaResolve};
pub use scheduler::Scheduler;
pub use schema::{
    normalize_schema_key, SchemaDoc, SchemaResolver, StaticSchemas, ACCOUNT_MARKER, GROUP_MARKER,
    META_SCHEMA_MARKER, META_SCHEMA_TITLE,
};
pub use store::{ReadState, Store, StoreSubscription, WeakStore};
pub use unified::{has_query_objects, is_query_object};

/// Time provider trait for testing.
///
/// Allows injecting controlled time into the engine and peers for testing
/// timeout and cleanup behavior. Timestamps are Unix milliseconds.
pub trait TimeProvider {
    /// Returns the current Unix timestamp in milliseconds.
    fn now_ms(&self) -> i64;
}

impl<F> TimeProvider for F
where
    F: Fn() -> i64,
{
    fn now_ms(&self) -> i64 {
        self()
    }
}
