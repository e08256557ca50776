//! Lazy projection expressions over records.
//!
//! A map configuration `{target: expression, …}` projects a record without
//! materializing anything beyond the traversal paths: references are loaded
//! only when a path steps through them. The interpreter is total: any
//! syntactic failure, timeout, or cycle makes the offending key `undefined`
//! (omitted) instead of failing the read.

use crate::co_id::CoId;
use crate::extract::extract;
use crate::peer::Peer;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::trace;

/// Placeholder substituted when `:asDataUrl` cannot produce a data URL.
pub const DATA_URL_PLACEHOLDER: &str = "data:application/octet-stream;base64,";

/// One parsed projection expression.
#[derive(Debug, Clone, PartialEq)]
pub enum MapExpr {
    /// Bare field pass-through from the record.
    Field(String),
    /// `$path` / `$$path`: resolve from the current item, loading
    /// references along the way. `as_data_url` is the `:asDataUrl` suffix.
    Path {
        /// Dot-separated segments; purely numeric segments index arrays.
        segments: Vec<String>,
        /// Whether the terminal value is converted to a data URL.
        as_data_url: bool,
    },
    /// `"*": "N"`: expand all top-level keys to depth N (objects only).
    ExpandAll(u8),
    /// `{$mapFields: [{label, valuePath}]}`: labeled field extraction.
    MapFields(Vec<(String, String)>),
}

/// Parses one map-configuration entry. `None` means the expression is
/// syntactically invalid and the key stays undefined.
pub fn parse_map_expr(target: &str, expr: &Value) -> Option<MapExpr> {
    match expr {
        Value::String(s) => {
            if target == "*" {
                let depth: u8 = s.parse().ok()?;
                if (1..=8).contains(&depth) {
                    return Some(MapExpr::ExpandAll(depth));
                }
                return None;
            }
            let path = s
                .strip_prefix("$$")
                .or_else(|| s.strip_prefix('$'));
            match path {
                Some(path) => {
                    let (path, as_data_url) = match path.strip_suffix(":asDataUrl") {
                        Some(stripped) => (stripped, true),
                        None => (path, false),
                    };
                    if path.is_empty() || path.split('.').any(str::is_empty) {
                        return None;
                    }
                    Some(MapExpr::Path {
                        segments: path.split('.').map(str::to_string).collect(),
                        as_data_url,
                    })
                }
                None => {
                    if s.is_empty() {
                        None
                    } else {
                        Some(MapExpr::Field(s.clone()))
                    }
                }
            }
        }
        Value::Object(obj) => {
            let fields = obj.get("$mapFields")?.as_array()?;
            let mut parsed = Vec::with_capacity(fields.len());
            for field in fields {
                let label = field.get("label")?.as_str()?;
                let value_path = field.get("valuePath")?.as_str()?;
                parsed.push((label.to_string(), value_path.to_string()));
            }
            Some(MapExpr::MapFields(parsed))
        }
        _ => None,
    }
}

/// References touched while applying a map.
#[derive(Debug, Default)]
pub struct MapOutcome {
    /// Root-property references: dependency subscriptions are installed
    /// for these so that upstream mutation re-projects the record.
    pub deps: Vec<CoId>,
    /// References on a traversal path that were not yet available; loads
    /// have been triggered and subscriptions should re-run the projection.
    pub pending: Vec<CoId>,
}

impl MapOutcome {
    fn note_dep(&mut self, id: &CoId) {
        if !self.deps.contains(id) {
            self.deps.push(id.clone());
        }
    }

    fn note_pending(&mut self, id: &CoId) {
        if !self.pending.contains(id) {
            self.pending.push(id.clone());
        }
    }
}

/// Applies a map configuration to a record.
///
/// The output starts as the record itself; each target key is assigned its
/// projected value (or omitted when undefined). Afterwards, for every
/// expression whose root property holds a raw reference, the root property
/// is removed when the target key differs from it.
pub fn apply_map(
    peer: &Rc<dyn Peer>,
    meta_schema: Option<&CoId>,
    record: &Value,
    map: &Map<String, Value>,
    visited: &mut HashSet<CoId>,
    outcome: &mut MapOutcome,
) -> Value {
    let mut output = record.clone();
    let mut roots_to_remove: Vec<String> = Vec::new();

    for (target, expr) in map {
        let Some(expr) = parse_map_expr(target, expr) else {
            trace!(target = %target, "invalid map expression; key undefined");
            continue;
        };

        match expr {
            MapExpr::Field(field) => {
                note_raw_ref_root(record, &field, target, outcome, &mut roots_to_remove);
                match record.get(&field) {
                    Some(value) => {
                        set_key(&mut output, target, value.clone());
                    }
                    None => unset_key(&mut output, target),
                }
            }
            MapExpr::Path {
                segments,
                as_data_url,
            } => {
                let root = &segments[0];
                note_raw_ref_root(record, root, target, outcome, &mut roots_to_remove);
                let resolved =
                    traverse_path(peer, meta_schema, record, &segments, visited, outcome);
                let resolved = if as_data_url {
                    Some(to_data_url(peer, resolved))
                } else {
                    resolved
                };
                match resolved {
                    Some(value) => set_key(&mut output, target, value),
                    None => unset_key(&mut output, target),
                }
            }
            MapExpr::ExpandAll(depth) => {
                if let Some(expanded) = record.as_object().map(|obj| {
                    obj.iter()
                        .map(|(k, v)| (k.clone(), expand_depth(v, depth)))
                        .collect::<Map<String, Value>>()
                }) {
                    for (key, value) in expanded {
                        set_key(&mut output, &key, value);
                    }
                }
            }
            MapExpr::MapFields(fields) => {
                let projected: Vec<Value> = fields
                    .iter()
                    .map(|(label, value_path)| {
                        json!({
                            "label": label,
                            "value": record.get(value_path).cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect();
                set_key(&mut output, target, Value::Array(projected));
            }
        }
    }

    if let Some(obj) = output.as_object_mut() {
        for root in roots_to_remove {
            obj.remove(&root);
        }
    }
    output
}

/// Records a root property holding a raw reference: it becomes a map
/// dependency, and is removed from the output when the target differs.
fn note_raw_ref_root(
    record: &Value,
    root: &str,
    target: &str,
    outcome: &mut MapOutcome,
    roots_to_remove: &mut Vec<String>,
) {
    let Some(id) = record.get(root).and_then(CoId::from_value) else {
        return;
    };
    outcome.note_dep(&id);
    if target != root && !roots_to_remove.iter().any(|r| r == root) {
        roots_to_remove.push(root.to_string());
    }
}

/// Walks a dot path, loading and extracting references encountered along
/// the way. Only values on the traversal path are resolved.
fn traverse_path(
    peer: &Rc<dyn Peer>,
    meta_schema: Option<&CoId>,
    record: &Value,
    segments: &[String],
    visited: &mut HashSet<CoId>,
    outcome: &mut MapOutcome,
) -> Option<Value> {
    let mut current = record.clone();
    for segment in segments {
        current = step_into_ref(peer, meta_schema, current, visited, outcome)?;
        current = match &current {
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?.clone()
            }
            Value::Object(obj) => obj.get(segment)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

/// If the value is a reference, loads and extracts it; otherwise returns
/// it unchanged. Cycles and unavailable references yield `None`.
fn step_into_ref(
    peer: &Rc<dyn Peer>,
    meta_schema: Option<&CoId>,
    value: Value,
    visited: &mut HashSet<CoId>,
    outcome: &mut MapOutcome,
) -> Option<Value> {
    let Some(id) = CoId::from_value(&value) else {
        return Some(value);
    };
    if !visited.insert(id.clone()) {
        trace!(id = %id, "reference cycle in map path");
        return None;
    }

    let handle = peer.entry(&id);
    if !handle.is_available() {
        peer.load(&id);
        outcome.note_pending(&id);
        return None;
    }
    extract(&handle, None, meta_schema)
}

/// Renders a binary payload as a data URL.
pub(crate) fn binary_data_url(blob: &crate::peer::BinaryBlob) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(&blob.bytes);
    format!("data:{};base64,{}", blob.mime, encoded)
}

/// Converts a terminal reference to a binary co-value into a data URL.
/// Anything else becomes the fixed placeholder.
fn to_data_url(peer: &Rc<dyn Peer>, value: Option<Value>) -> Value {
    let blob = value
        .as_ref()
        .and_then(CoId::from_value)
        .and_then(|id| peer.load_binary(&id));
    match blob {
        Some(blob) => Value::String(binary_data_url(&blob)),
        None => Value::String(DATA_URL_PLACEHOLDER.to_string()),
    }
}

/// Depth-limited copy: recurses into objects only, truncating at the
/// bound; arrays and scalars pass through unchanged.
fn expand_depth(value: &Value, depth: u8) -> Value {
    match value {
        Value::Object(obj) => {
            if depth == 0 {
                return Value::Object(Map::new());
            }
            Value::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), expand_depth(v, depth - 1)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn set_key(output: &mut Value, key: &str, value: Value) {
    if let Some(obj) = output.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
}

fn unset_key(output: &mut Value, key: &str) {
    if let Some(obj) = output.as_object_mut() {
        obj.remove(key);
    }
}
