//! Per-schema index lists in the OS map.
//!
//! The OS map carries an `indexes` comap mapping schema co-ids to colist
//! co-ids. Index lists are created lazily and only for schemas with the
//! `indexing` flag. Appends happen at the write-hook level (local and
//! replicated creates alike), not in the CRUD path; duplicates can occur
//! under replication races and are deduplicated at read.

use crate::co_id::CoId;
use crate::loader::CoValueLoader;
use crate::peer::{CoKind, CreateRequest, Peer};
use crate::schema::SchemaResolver;
use serde_json::{json, Value};
use std::rc::Rc;
use tracing::{debug, warn};

/// Key of the index registry inside the OS map.
const INDEXES_KEY: &str = "indexes";

/// Budget for loading the OS map and index lists; they are local values
/// and load fast or not at all.
const INDEX_WAIT_MS: u64 = 1_000;

/// Maintains per-schema index lists in the OS map.
#[derive(Clone)]
pub struct IndexManager {
    peer: Rc<dyn Peer>,
    schemas: Rc<dyn SchemaResolver>,
    loader: CoValueLoader,
    os: CoId,
}

impl IndexManager {
    /// Creates a manager rooted at the OS map.
    pub fn new(peer: Rc<dyn Peer>, schemas: Rc<dyn SchemaResolver>, os: CoId) -> Self {
        let loader = CoValueLoader::new(Rc::clone(&peer));
        Self {
            peer,
            schemas,
            loader,
            os,
        }
    }

    /// Resolves a schema key or co-id to a schema co-id.
    pub fn resolve_schema(&self, key: &str) -> Option<CoId> {
        if CoId::looks_like(key) {
            return CoId::parse(key).ok();
        }
        self.schemas.resolve(key)
    }

    /// Returns the index list co-id for a schema, creating it lazily when
    /// the schema is indexable. `None` (silently) otherwise.
    pub fn index_list_for(&self, schema: &CoId) -> Option<CoId> {
        let indexes = self.indexes_handle(false)?;
        if let Some(existing) = indexes.get(schema.as_str()).and_then(|v| CoId::from_value(&v)) {
            return Some(existing);
        }
        self.ensure_index_list(schema)
    }

    /// Creates an empty index list for an indexable schema and registers
    /// it. Returns `None` when the schema is not indexable.
    pub fn ensure_index_list(&self, schema: &CoId) -> Option<CoId> {
        let doc = self.schemas.document(schema)?;
        if !doc.indexing {
            return None;
        }

        let indexes = self.indexes_handle(true)?;
        if let Some(existing) = indexes.get(schema.as_str()).and_then(|v| CoId::from_value(&v)) {
            return Some(existing);
        }

        let list = self
            .peer
            .create_co_value(CreateRequest {
                schema: None,
                kind: CoKind::List,
                data: json!([]),
                spark: None,
                is_schema_definition: false,
            })
            .ok()?;

        if let Err(err) = indexes.set(schema.as_str(), Value::String(list.as_str().to_string())) {
            warn!(schema = %schema, %err, "failed to register index list");
            return None;
        }
        debug!(schema = %schema, list = %list, "created index list");
        Some(list)
    }

    /// Records a freshly written co-value in its schema's index list.
    /// Called from the storage-level write hook for local and replicated
    /// creates. Failures are swallowed.
    pub fn record_created(&self, id: &CoId, schema: &CoId) {
        let Some(list_id) = self.index_list_for(schema) else {
            return;
        };
        let Ok(list) = self.loader.ensure(list_id.as_str(), true, INDEX_WAIT_MS) else {
            warn!(list = %list_id, "index list unavailable; skipping append");
            return;
        };
        if let Err(err) = list.append(Value::String(id.as_str().to_string())) {
            warn!(id = %id, %err, "failed to append to index list");
        }
    }

    /// Best-effort removal of a co-value from its schema's index list.
    /// Non-fatal on any failure.
    pub fn remove_from_index(&self, id: &CoId, schema: &CoId) {
        let Some(list_id) = self.index_list_for(schema) else {
            return;
        };
        let Ok(list) = self.loader.ensure(list_id.as_str(), true, INDEX_WAIT_MS) else {
            return;
        };
        // Replication races can leave duplicates; remove them all.
        let item = Value::String(id.as_str().to_string());
        loop {
            match list.remove_item(&item) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    debug!(id = %id, %err, "index removal skipped");
                    break;
                }
            }
        }
    }

    /// Loads the `indexes` comap, creating it when `create` is set.
    fn indexes_handle(&self, create: bool) -> Option<crate::peer::CoHandle> {
        let os = self
            .loader
            .ensure(self.os.as_str(), true, INDEX_WAIT_MS)
            .ok()?;

        if let Some(id) = os.get(INDEXES_KEY).and_then(|v| CoId::from_value(&v)) {
            return self.loader.ensure(id.as_str(), true, INDEX_WAIT_MS).ok();
        }
        if !create {
            return None;
        }

        let id = self
            .peer
            .create_co_value(CreateRequest {
                schema: None,
                kind: CoKind::Map,
                data: json!({}),
                spark: None,
                is_schema_definition: false,
            })
            .ok()?;
        os.set(INDEXES_KEY, Value::String(id.as_str().to_string()))
            .ok()?;
        self.loader.ensure(id.as_str(), true, INDEX_WAIT_MS).ok()
    }
}

/// Deduplicates a snapshot of index list items into co-ids, preserving
/// first-occurrence order.
pub fn dedup_ids(items: &[Value]) -> Vec<CoId> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if let Some(id) = CoId::from_value(item) {
            if seen.insert(id.clone()) {
                out.push(id);
            }
        }
    }
    out
}
