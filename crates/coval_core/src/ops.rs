//! Validated mutations and the uniform operation gate.
//!
//! Mutation paths throw for caller-meaningful errors (invalid id, not
//! found, validation failure); the [`Engine::execute`] gate wraps every
//! operation into the `{ok, data?, errors?}` envelope instead.

use crate::co_id::CoId;
use crate::engine::Engine;
use crate::error::{CovalError, Result};
use crate::extract::{extract, is_empty_skeleton, schema_attribution};
use crate::index::dedup_ids;
use crate::map_transform::binary_data_url;
use crate::peer::{CoHandle, CoKind, CreateRequest};
use crate::read::{matches_filter, ReadOptions, ReadRequest};
use crate::schema::{ACCOUNT_MARKER, GROUP_MARKER};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Budget for the post-create readiness read.
const CREATE_READ_TIMEOUT_MS: u64 = 1_000;

/// Budget for per-item loads in [`Engine::find_first`].
const FIND_FIRST_TIMEOUT_MS: u64 = 1_000;

/// Metadata keys stripped before validation merges.
fn strip_metadata(record: &Value) -> Map<String, Value> {
    match record.as_object() {
        Some(obj) => obj
            .iter()
            .filter(|(key, _)| {
                *key != "id" && *key != "type" && *key != "$schema" && !key.starts_with('_')
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        None => Map::new(),
    }
}

impl Engine {
    /// Creates a validated co-value and reads it back.
    ///
    /// The cotype comes from the schema document, falling back to the data
    /// shape (array becomes a colist, object a comap; strings are
    /// rejected). Creating with the meta-schema yields a schema definition
    /// and forces a comap. Indexing is not performed here; the
    /// storage-level write hook observes the create.
    pub fn create(&self, schema_key: &str, data: Value, spark: Option<CoId>) -> Result<Value> {
        let schema = self
            .inner
            .index
            .resolve_schema(schema_key)
            .ok_or_else(|| CovalError::SchemaUnresolved(schema_key.to_string()))?;
        let doc = self.inner.schemas.document(&schema);

        let is_schema_definition = doc.as_ref().map(|d| d.is_meta_schema()).unwrap_or(false);
        let kind = if is_schema_definition {
            CoKind::Map
        } else {
            match doc.as_ref().and_then(|d| d.cotype) {
                Some(kind) => kind,
                None if data.is_array() => CoKind::List,
                None if data.is_object() => CoKind::Map,
                None => {
                    return Err(CovalError::UnsupportedOperation {
                        op: "create".to_string(),
                        kind: json_kind(&data).to_string(),
                    })
                }
            }
        };

        let id = self.inner.peer.create_co_value(CreateRequest {
            schema: Some(schema.clone()),
            kind,
            data: data.clone(),
            spark,
            is_schema_definition,
        })?;

        // Storage sync is non-blocking; only readiness is awaited, briefly.
        let mut opts = self.default_read_options();
        opts.timeout_ms = CREATE_READ_TIMEOUT_MS;
        let store = self.read_co_value(id.as_str(), None, &opts);
        let read_back = store.get().value().cloned();

        let mut merged = Map::new();
        merged.insert("id".to_string(), json!(id.as_str()));
        if let Some(data) = data.as_object() {
            for (key, value) in data {
                merged.insert(key.clone(), value.clone());
            }
        }
        match read_back {
            Some(Value::Object(extracted)) => {
                for (key, value) in extracted {
                    merged.insert(key, value);
                }
            }
            _ => {
                debug!(id = %id, "created value not ready in time; returning fallback");
                merged.insert("type".to_string(), json!(kind.as_str()));
                merged.insert("schema".to_string(), json!(schema.as_str()));
            }
        }
        // Returned records always carry the new address, even for schema
        // definitions whose extracted form suppresses it.
        merged.insert("id".to_string(), json!(id.as_str()));
        Ok(Value::Object(merged))
    }

    /// Validated update of a comap. The schema is taken from the co-value
    /// header, never from the caller.
    pub fn update(&self, _schema_key: &str, id_str: &str, data: Value) -> Result<Value> {
        let id = CoId::parse(id_str)?;
        let handle = self
            .inner
            .loader
            .ensure(id_str, true, self.inner.config.read.timeout_ms)?;
        let header = handle.header().ok_or_else(|| {
            CovalError::InternalInvariant(format!("available without header: {id_str}"))
        })?;
        if header.kind != CoKind::Map {
            return Err(CovalError::UnsupportedOperation {
                op: "update".to_string(),
                kind: header.kind.as_str().to_string(),
            });
        }
        let update = data.as_object().ok_or_else(|| {
            CovalError::Serialization("update data must be an object".to_string())
        })?;

        let meta = self.inner.schemas.meta_schema();
        let attribution = schema_attribution(&header, meta.as_ref(), None);
        // The exemption set: account and group records, plus anything
        // attributed to the system spark.
        let exempt = match attribution.as_deref() {
            Some(ACCOUNT_MARKER) | Some(GROUP_MARKER) => true,
            _ => {
                let system = self.system_spark();
                system.is_some() && header.spark == system
            }
        };

        if !exempt {
            if let Some(schema) = &header.schema {
                self.validate_update(schema, &handle, update, meta.as_ref())?;
            }
        }

        for (key, value) in update {
            handle.set(key, value.clone())?;
        }
        self.inner.cache.invalidate_resolved_data(&id);

        extract(&handle, None, meta.as_ref()).ok_or_else(|| {
            CovalError::InternalInvariant(format!("updated value unavailable: {id_str}"))
        })
    }

    /// Merge-then-validate, rejecting before any mutation.
    fn validate_update(
        &self,
        schema: &CoId,
        handle: &CoHandle,
        update: &Map<String, Value>,
        meta: Option<&CoId>,
    ) -> Result<()> {
        let current = extract(handle, None, meta).unwrap_or_else(|| json!({}));
        let allowed: Option<HashSet<String>> = self
            .inner
            .schemas
            .document(schema)
            .and_then(|doc| doc.properties)
            .map(|properties| properties.keys().cloned().collect());

        let mut merged = strip_metadata(&current);
        for (key, value) in strip_metadata(&Value::Object(update.clone())) {
            merged.insert(key, value);
        }
        if let Some(allowed) = &allowed {
            merged.retain(|key, _| allowed.contains(key));
        }

        self.inner
            .schemas
            .validate(schema, &Value::Object(merged))
            .map_err(|messages| CovalError::ValidationFailure { messages })
    }

    /// Hard delete of a comap: best-effort index removal, then every key
    /// deleted, then storage sync.
    pub fn delete(&self, schema_key: &str, id_str: &str) -> Result<()> {
        let id = CoId::parse(id_str)?;
        let handle = self
            .inner
            .loader
            .ensure(id_str, true, self.inner.config.read.timeout_ms)?;
        let header = handle.header().ok_or_else(|| {
            CovalError::InternalInvariant(format!("available without header: {id_str}"))
        })?;
        if header.kind != CoKind::Map {
            return Err(CovalError::UnsupportedOperation {
                op: "delete".to_string(),
                kind: header.kind.as_str().to_string(),
            });
        }

        let index_schema = header
            .schema
            .clone()
            .or_else(|| self.inner.index.resolve_schema(schema_key));
        if let Some(schema) = index_schema {
            self.inner.index.remove_from_index(&id, &schema);
        }

        for entry in handle.map_entries() {
            handle.delete_key(&entry.key)?;
        }
        if let Err(err) = self.inner.peer.sync() {
            warn!(id = %id, %err, "storage sync after delete failed");
        }
        self.inner.cache.invalidate_resolved_data(&id);
        Ok(())
    }

    /// Non-reactive, non-cached existence probe over a schema's index.
    pub fn find_first(&self, schema_key: &str, filter: &Value) -> Result<Option<Value>> {
        let schema = self
            .inner
            .index
            .resolve_schema(schema_key)
            .ok_or_else(|| CovalError::SchemaUnresolved(schema_key.to_string()))?;
        let Some(list_id) = self.inner.index.index_list_for(&schema) else {
            return Ok(None);
        };
        let Ok(list) = self
            .inner
            .loader
            .ensure(list_id.as_str(), true, FIND_FIRST_TIMEOUT_MS)
        else {
            return Ok(None);
        };

        let meta = self.inner.schemas.meta_schema();
        for item_id in dedup_ids(&list.list_items()) {
            let Ok(handle) =
                self.inner
                    .loader
                    .ensure(item_id.as_str(), true, FIND_FIRST_TIMEOUT_MS)
            else {
                continue;
            };
            let Some(record) = extract(&handle, None, meta.as_ref()) else {
                continue;
            };
            if is_empty_skeleton(&record) {
                continue;
            }
            if matches_filter(&record, filter) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Flips a boolean field on a comap.
    pub fn toggle(&self, _schema_key: &str, id_str: &str, field: &str) -> Result<Value> {
        let id = CoId::parse(id_str)?;
        let handle = self
            .inner
            .loader
            .ensure(id_str, true, self.inner.config.read.timeout_ms)?;

        match handle.get(field) {
            Some(Value::Bool(current)) => {
                handle.set(field, Value::Bool(!current))?;
                self.inner.cache.invalidate_resolved_data(&id);
                let meta = self.inner.schemas.meta_schema();
                extract(&handle, None, meta.as_ref()).ok_or_else(|| {
                    CovalError::InternalInvariant(format!("toggled value unavailable: {id_str}"))
                })
            }
            _ => Err(CovalError::ValidationFailure {
                messages: vec![format!("{field} is not a boolean field")],
            }),
        }
    }

    /// Appends an item to a costream under this peer's session.
    pub fn push_item(&self, co_id: &str, item: Value) -> Result<()> {
        let id = CoId::parse(co_id)?;
        let handle = self
            .inner
            .loader
            .ensure(co_id, true, self.inner.config.read.timeout_ms)?;
        if handle.kind() != Some(CoKind::Stream) {
            return Err(CovalError::UnsupportedOperation {
                op: "push".to_string(),
                kind: handle
                    .kind()
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_else(|| "unloaded".to_string()),
            });
        }
        handle.push(
            &self.inner.peer.session_id(),
            item,
            self.inner.peer.now_ms(),
        )?;
        self.inner.cache.invalidate_resolved_data(&id);
        Ok(())
    }

    /// Resolves a human-readable key to a co-id.
    pub fn resolve_key(&self, key: &str) -> Result<CoId> {
        self.inner
            .index
            .resolve_schema(key)
            .ok_or_else(|| CovalError::SchemaUnresolved(key.to_string()))
    }

    /// Loads a binary co-value as a data URL.
    pub fn load_binary_as_blob(&self, co_id: &str) -> Result<Value> {
        let id = CoId::parse(co_id)?;
        let blob = self
            .inner
            .peer
            .load_binary(&id)
            .ok_or_else(|| CovalError::NotFound(id.as_str().to_string()))?;
        Ok(json!({ "dataUrl": binary_data_url(&blob) }))
    }

    /// Fetches a schema document by registry name or from a co-value's
    /// header.
    pub fn schema_document(
        &self,
        name: Option<&str>,
        from_co_value: Option<&str>,
    ) -> Result<Value> {
        let schema = if let Some(name) = name {
            self.resolve_key(name)?
        } else if let Some(from) = from_co_value {
            let id = CoId::parse(from)?;
            self.inner
                .loader
                .await_schema_in_header(&id, self.inner.config.read.timeout_ms)?
        } else {
            return Err(CovalError::SchemaUnresolved(
                "schema op needs schemaName or fromCoValue".to_string(),
            ));
        };
        let doc = self
            .inner
            .schemas
            .document(&schema)
            .ok_or_else(|| CovalError::SchemaUnresolved(schema.as_str().to_string()))?;
        serde_json::to_value(&doc).map_err(|e| CovalError::Serialization(e.to_string()))
    }

    /// The uniform operation gate: dispatches a tagged record and wraps
    /// the outcome in the `{ok, data?, errors?}` envelope.
    pub fn execute(&self, op: &Value) -> Value {
        match self.dispatch(op) {
            Ok(data) => json!({ "ok": true, "data": data }),
            Err(err) => json!({ "ok": false, "errors": [{ "message": err.to_string() }] }),
        }
    }

    fn dispatch(&self, op: &Value) -> Result<Value> {
        let obj = op.as_object().ok_or_else(|| {
            CovalError::Serialization("operation must be an object".to_string())
        })?;
        let name = obj.get("op").and_then(Value::as_str).ok_or_else(|| {
            CovalError::Serialization("operation is missing its op tag".to_string())
        })?;

        match name {
            "create" => {
                let schema = required_str(obj, "schema")?;
                let data = obj.get("data").cloned().unwrap_or_else(|| json!({}));
                let spark = obj
                    .get("spark")
                    .and_then(CoId::from_value);
                self.create(schema, data, spark)
            }
            "read" => {
                let req = ReadRequest {
                    co_id: obj.get("coId").and_then(Value::as_str).map(str::to_string),
                    schema: obj.get("schema").and_then(Value::as_str).map(str::to_string),
                    filter: obj.get("filter").cloned(),
                    hint: obj.get("hint").and_then(Value::as_str).map(str::to_string),
                    options: ReadOptions::from_value(
                        obj.get("options"),
                        &self.inner.config.read,
                    ),
                };
                let store = self.read(req);
                Ok(store.get().to_value())
            }
            "update" => {
                let schema = required_str(obj, "schema")?;
                let id = required_str(obj, "id")?;
                let data = obj.get("data").cloned().unwrap_or_else(|| json!({}));
                self.update(schema, id, data)
            }
            "delete" => {
                let schema = required_str(obj, "schema")?;
                let id = required_str(obj, "id")?;
                self.delete(schema, id)?;
                Ok(json!({ "id": id }))
            }
            "toggle" => {
                let schema = required_str(obj, "schema")?;
                let id = required_str(obj, "id")?;
                let field = required_str(obj, "field")?;
                self.toggle(schema, id, field)
            }
            "push" => {
                let co_id = required_str(obj, "coId")?;
                let item = obj.get("item").cloned().unwrap_or(Value::Null);
                self.push_item(co_id, item)?;
                Ok(json!({ "coId": co_id }))
            }
            "findOne" | "findFirst" => {
                let schema = required_str(obj, "schema")?;
                let filter = obj.get("filter").cloned().unwrap_or_else(|| json!({}));
                Ok(self.find_first(schema, &filter)?.unwrap_or(Value::Null))
            }
            "schema" => self.schema_document(
                obj.get("schemaName").and_then(Value::as_str),
                obj.get("fromCoValue").and_then(Value::as_str),
            ),
            "resolve" => {
                let key = required_str(obj, "humanReadableKey")?;
                Ok(json!(self.resolve_key(key)?.as_str()))
            }
            "loadBinaryAsBlob" => {
                let co_id = required_str(obj, "coId")?;
                self.load_binary_as_blob(co_id)
            }
            other => Err(CovalError::UnsupportedOperation {
                op: other.to_string(),
                kind: "gate".to_string(),
            }),
        }
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CovalError::Serialization(format!("operation is missing {key}")))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
