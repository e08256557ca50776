//! Projection of raw co-value content to normalized flat records.
//!
//! Extraction is a pure function over a handle snapshot: stable under
//! identical inputs, no side effects. Map records carry `id`, `type`, and
//! `$schema` metadata; schema definitions suppress `id` and `type`. String
//! values that parse as JSON objects or arrays are rehydrated once here so
//! all downstream code can assume fully hydrated records.

use crate::co_id::CoId;
use crate::peer::{CoHandle, CoHeader, CoKind, StreamItem};
use crate::schema::{ACCOUNT_MARKER, GROUP_MARKER, META_SCHEMA_MARKER};
use serde_json::{Map, Value};

/// Placeholder substituted for sealed values.
pub const SEALED_PLACEHOLDER: &str = "***";

/// Keys whose string values are never rehydrated even when they parse as
/// JSON. Error payloads and message bodies stay verbatim.
const REHYDRATE_PASSTHROUGH: [&str; 3] = ["error", "message", "content"];

/// Semantic type of a projected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Plain string.
    String,
    /// Number.
    Number,
    /// Boolean.
    Bool,
    /// Null.
    Null,
    /// Nested object.
    Object,
    /// Array.
    Array,
    /// Reference to another co-value.
    CoId,
    /// Namespaced schema key (e.g. `°Maia/schema/todo`, `@schema/todo`).
    Key,
    /// Masked sealed value.
    Sealed,
}

/// Classifies a projected value.
pub fn classify_value(value: &Value) -> ValueKind {
    match value {
        Value::Null => ValueKind::Null,
        Value::Bool(_) => ValueKind::Bool,
        Value::Number(_) => ValueKind::Number,
        Value::Array(_) => ValueKind::Array,
        Value::Object(_) => ValueKind::Object,
        Value::String(s) => {
            if s == SEALED_PLACEHOLDER {
                ValueKind::Sealed
            } else if CoId::looks_like(s) {
                ValueKind::CoId
            } else if s.starts_with('°') || s.starts_with('@') {
                ValueKind::Key
            } else {
                ValueKind::String
            }
        }
    }
}

/// Schema attribution for a header: the `$schema` co-id when present, or
/// one of the `@group` / `@account` / `@meta-schema` markers, or the
/// caller's hint.
pub fn schema_attribution(
    header: &CoHeader,
    meta_schema: Option<&CoId>,
    hint: Option<&str>,
) -> Option<String> {
    if let Some(schema) = &header.schema {
        if meta_schema == Some(schema) {
            return Some(META_SCHEMA_MARKER.to_string());
        }
        return Some(schema.as_str().to_string());
    }
    if header.ruleset.as_deref() == Some("group") {
        return Some(GROUP_MARKER.to_string());
    }
    if header.type_hint.as_deref() == Some("account") {
        return Some(ACCOUNT_MARKER.to_string());
    }
    hint.map(|h| h.to_string())
}

/// Projects a co-value snapshot to its record form.
///
/// Returns `None` when the co-value is not yet available. Maps project to
/// an object with metadata; lists to an ordered array; streams to a single
/// flattened, `madeAt`-ordered array of item values (see
/// [`extract_sessions`] for the session-preserving variant).
pub fn extract(handle: &CoHandle, hint: Option<&str>, meta_schema: Option<&CoId>) -> Option<Value> {
    let header = handle.header()?;
    if !handle.is_available() {
        return None;
    }

    match header.kind {
        CoKind::Map => {
            let attribution = schema_attribution(&header, meta_schema, hint);
            let schema_definition = attribution.as_deref() == Some(META_SCHEMA_MARKER);

            let mut record = Map::new();
            if !schema_definition {
                record.insert("id".to_string(), Value::String(handle.id().as_str().into()));
                record.insert(
                    "type".to_string(),
                    Value::String(header.kind.as_str().into()),
                );
            }
            if let Some(attribution) = attribution {
                record.insert("$schema".to_string(), Value::String(attribution));
            }
            for entry in handle.map_entries() {
                let value = if header.sealed.contains(&entry.key) {
                    Value::String(SEALED_PLACEHOLDER.to_string())
                } else {
                    rehydrate(&entry.key, entry.value)
                };
                record.insert(entry.key, value);
            }
            Some(Value::Object(record))
        }
        CoKind::List => Some(Value::Array(
            handle
                .list_items()
                .into_iter()
                .map(|item| rehydrate("", item))
                .collect(),
        )),
        CoKind::Stream => {
            let mut items: Vec<StreamItem> = handle
                .stream_sessions()
                .into_iter()
                .flat_map(|(_, log)| log)
                .collect();
            items.sort_by_key(|item| (item.made_at, item.tx));
            Some(Value::Array(
                items
                    .into_iter()
                    .map(|item| rehydrate("", item.value))
                    .collect(),
            ))
        }
    }
}

/// Session-preserving stream projection: session id to its ordered log,
/// with values rehydrated. Empty for non-streams.
pub fn extract_sessions(handle: &CoHandle) -> Vec<(String, Vec<StreamItem>)> {
    handle
        .stream_sessions()
        .into_iter()
        .map(|(session, log)| {
            let log = log
                .into_iter()
                .map(|item| StreamItem {
                    value: rehydrate("", item.value),
                    made_at: item.made_at,
                    tx: item.tx,
                })
                .collect();
            (session, log)
        })
        .collect()
}

/// Whether a projected map record is an empty skeleton: its keys are a
/// subset of the metadata keys `{id, type, $schema}`. Such records are
/// suppressed from collection and all-read outputs.
pub fn is_empty_skeleton(value: &Value) -> bool {
    match value.as_object() {
        Some(record) => record
            .keys()
            .all(|key| key == "id" || key == "type" || key == "$schema"),
        None => false,
    }
}

/// Rehydrates JSON-string values into objects/arrays, recursively, except
/// for keys in the passthrough set.
fn rehydrate(key: &str, value: Value) -> Value {
    if REHYDRATE_PASSTHROUGH.contains(&key) {
        return value;
    }
    match value {
        Value::String(s) => {
            let trimmed = s.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                match serde_json::from_str::<Value>(&s) {
                    Ok(parsed @ (Value::Object(_) | Value::Array(_))) => rehydrate_tree(parsed),
                    _ => Value::String(s),
                }
            } else {
                Value::String(s)
            }
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = rehydrate(&k, v);
                    (k, v)
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| rehydrate("", v)).collect())
        }
        other => other,
    }
}

/// Applies [`rehydrate`] below the top level, after a string has already
/// been parsed.
fn rehydrate_tree(value: Value) -> Value {
    rehydrate("", value)
}
