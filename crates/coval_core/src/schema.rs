//! Schema resolution capability and schema documents.
//!
//! The engine never interprets a schema document format beyond the fields
//! below; a [`SchemaResolver`] maps human-readable keys and co-ids to
//! documents and runs validation. [`StaticSchemas`] is an in-memory registry
//! with a narrow property-type validator, sufficient for embedding and
//! tests. A general JSON Schema engine is explicitly out of scope.

use crate::co_id::CoId;
use crate::peer::CoKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Schema marker for group-ruleset co-values without a header schema.
pub const GROUP_MARKER: &str = "@group";

/// Schema marker for account co-values without a header schema.
pub const ACCOUNT_MARKER: &str = "@account";

/// Schema marker for the distinguished meta-schema.
pub const META_SCHEMA_MARKER: &str = "@meta-schema";

/// Title that distinguishes the meta-schema document. Records created with
/// a schema carrying this title are schema definitions.
pub const META_SCHEMA_TITLE: &str = "meta-schema";

/// A resolved schema document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDoc {
    /// Content address of the schema record.
    #[serde(rename = "$id")]
    pub id: CoId,

    /// The schema's own schema (the meta-schema, usually).
    #[serde(rename = "$schema", default)]
    pub schema: Option<CoId>,

    /// Kind of co-value this schema describes.
    #[serde(default)]
    pub cotype: Option<CoKind>,

    /// Human-readable title.
    #[serde(default)]
    pub title: Option<String>,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Declared properties: name to `{"type": …}` descriptors.
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,

    /// Item descriptor for list- and stream-shaped values. May carry a
    /// `$co` reference to the item schema.
    #[serde(default)]
    pub items: Option<Value>,

    /// Whether records of this schema are tracked in an index list.
    #[serde(default)]
    pub indexing: bool,
}

impl SchemaDoc {
    /// Creates a document with a content-derived id for a registry key.
    pub fn named(key: &str) -> Self {
        Self {
            id: CoId::from_content(format!("schema:{key}").as_bytes()),
            schema: None,
            cotype: None,
            title: Some(key.to_string()),
            description: None,
            properties: None,
            items: None,
            indexing: false,
        }
    }

    /// Whether this document is the meta-schema (schemas-of-schemas).
    pub fn is_meta_schema(&self) -> bool {
        self.title.as_deref() == Some(META_SCHEMA_TITLE)
    }
}

/// Strips the namespace marker from a human-readable schema key.
///
/// Keys arrive intact on the wire (`°Maia/schema/todo`, `@schema/todo`);
/// registries are consulted under the normalized last segment.
pub fn normalize_schema_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Capability mapping schema keys and co-ids to documents and validators.
pub trait SchemaResolver {
    /// Resolves a human-readable key to a schema co-id.
    fn resolve(&self, key: &str) -> Option<CoId>;

    /// Fetches the document for a schema co-id.
    fn document(&self, id: &CoId) -> Option<SchemaDoc>;

    /// Validates a record against a schema. `Ok` when no validator is
    /// registered for the schema.
    fn validate(&self, id: &CoId, record: &Value) -> std::result::Result<(), Vec<String>>;

    /// The distinguished meta-schema id, when known.
    fn meta_schema(&self) -> Option<CoId> {
        None
    }
}

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<String, CoId>,
    docs: HashMap<CoId, SchemaDoc>,
    meta: Option<CoId>,
}

/// In-memory schema registry with property-type validation.
///
/// Cheaply cloneable; clones share the registry. A fresh registry always
/// carries the meta-schema under the key `"schema"`.
#[derive(Clone)]
pub struct StaticSchemas {
    inner: Rc<RefCell<RegistryInner>>,
}

impl StaticSchemas {
    /// Creates a registry seeded with the meta-schema.
    pub fn new() -> Self {
        let registry = Self {
            inner: Rc::new(RefCell::new(RegistryInner::default())),
        };
        let mut meta = SchemaDoc::named("schema");
        meta.title = Some(META_SCHEMA_TITLE.to_string());
        meta.cotype = Some(CoKind::Map);
        let meta_id = registry.register("schema", meta);
        registry.inner.borrow_mut().meta = Some(meta_id);
        registry
    }

    /// Registers a document under a key (normalized) and returns its id.
    pub fn register(&self, key: &str, doc: SchemaDoc) -> CoId {
        let id = doc.id.clone();
        let mut inner = self.inner.borrow_mut();
        inner
            .by_key
            .insert(normalize_schema_key(key).to_string(), id.clone());
        inner.docs.insert(id.clone(), doc);
        id
    }

    /// All registered keys, for registry introspection.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.borrow().by_key.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for StaticSchemas {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaResolver for StaticSchemas {
    fn resolve(&self, key: &str) -> Option<CoId> {
        if CoId::looks_like(key) {
            return CoId::parse(key).ok();
        }
        self.inner
            .borrow()
            .by_key
            .get(normalize_schema_key(key))
            .cloned()
    }

    fn document(&self, id: &CoId) -> Option<SchemaDoc> {
        self.inner.borrow().docs.get(id).cloned()
    }

    fn validate(&self, id: &CoId, record: &Value) -> std::result::Result<(), Vec<String>> {
        let Some(doc) = self.document(id) else {
            return Ok(());
        };
        let Some(properties) = doc.properties else {
            return Ok(());
        };
        let Some(record) = record.as_object() else {
            return Ok(());
        };

        let mut messages = Vec::new();
        for (key, descriptor) in &properties {
            let Some(value) = record.get(key) else {
                continue;
            };
            let Some(expected) = descriptor.get("type").and_then(Value::as_str) else {
                continue;
            };
            let actual = json_type_name(value);
            if !type_matches(expected, value) {
                messages.push(format!("{key}: expected {expected}, got {actual}"));
            }
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(messages)
        }
    }

    fn meta_schema(&self) -> Option<CoId> {
        self.inner.borrow().meta.clone()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "boolean" => value.is_boolean(),
        "number" | "integer" => value.is_number(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown descriptors (e.g. "co-id") accept strings.
        _ => value.is_string(),
    }
}
