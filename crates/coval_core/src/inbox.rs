//! Inbox processing: once-only dispatch over a session-partitioned stream.
//!
//! An inbox is a costream whose items reference message comaps. Delivery is
//! at most once: a message is marked `processed` through the gate before it
//! is handed to the caller, and the mark is a last-writer-wins update, so
//! racing processors converge.

use crate::co_id::CoId;
use crate::engine::Engine;
use crate::error::{CovalError, Result};
use crate::extract::{extract, extract_sessions};
use crate::peer::CoKind;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Message keys that are internal bookkeeping, dropped from delivery.
fn is_internal_key(key: &str) -> bool {
    key == "processed"
        || key == "id"
        || key == "$schema"
        || key == "hasProperties"
        || key == "properties"
        || key.starts_with('_')
}

/// Finds an unresolved expression anywhere in a payload, returning the
/// offending string.
fn find_expression(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.contains("{{") && s.contains("}}") => Some(s.clone()),
        Value::Object(obj) => obj.values().find_map(find_expression),
        Value::Array(items) => items.iter().find_map(find_expression),
        _ => None,
    }
}

impl Engine {
    /// Creates a message through the gate and pushes its co-id onto the
    /// inbox stream.
    ///
    /// The message schema is discovered from the inbox schema's `items.$co`
    /// reference, falling back to the `event` schema. Payloads must be
    /// fully resolved plain data.
    pub fn create_and_push_message(&self, inbox_id: &str, message: Value) -> Result<Value> {
        let inbox = self
            .inner
            .loader
            .ensure(inbox_id, true, self.inner.config.read.timeout_ms)?;
        if inbox.kind() != Some(CoKind::Stream) {
            return Err(CovalError::UnsupportedOperation {
                op: "createAndPushMessage".to_string(),
                kind: inbox
                    .kind()
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_else(|| "unloaded".to_string()),
            });
        }

        let item_schema_key = inbox
            .header()
            .and_then(|h| h.schema)
            .and_then(|schema| self.inner.schemas.document(&schema))
            .and_then(|doc| doc.items)
            .and_then(|items| {
                items
                    .get("$co")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        let schema = item_schema_key
            .as_deref()
            .and_then(|key| self.inner.index.resolve_schema(key))
            .or_else(|| self.inner.index.resolve_schema("event"))
            .ok_or_else(|| {
                CovalError::SchemaUnresolved("no message schema for inbox".to_string())
            })?;

        let mut data = message
            .as_object()
            .cloned()
            .ok_or_else(|| CovalError::Serialization("message must be an object".to_string()))?;
        data.entry("processed".to_string())
            .or_insert(Value::Bool(false));

        if let Some(expression) = find_expression(&Value::Object(data.clone())) {
            return Err(CovalError::ExpressionUnresolved(expression));
        }

        let record = self.create(schema.as_str(), Value::Object(data), None)?;
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CovalError::InternalInvariant("create returned a record without id".to_string())
            })?
            .to_string();
        self.push_item(inbox_id, json!(id))?;
        Ok(record)
    }

    /// Drains unprocessed messages from an inbox, at most once each.
    ///
    /// Returns `{"messages": [...]}` sorted by `_madeAt` ascending. Each
    /// delivered message is marked `processed` through the gate before it
    /// enters the result, and the mark is verified with a bounded re-read
    /// that never hard-fails.
    pub fn process_inbox(&self, actor_id: &str, inbox_id: &str) -> Result<Value> {
        let inbox = self
            .inner
            .loader
            .ensure(inbox_id, true, self.inner.config.inbox.message_timeout_ms)?;
        if inbox.kind() != Some(CoKind::Stream) {
            return Err(CovalError::UnsupportedOperation {
                op: "processInbox".to_string(),
                kind: inbox
                    .kind()
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_else(|| "unloaded".to_string()),
            });
        }

        let meta = self.inner.schemas.meta_schema();
        let mut delivered: Vec<Value> = Vec::new();

        for (session_id, items) in extract_sessions(&inbox) {
            for item in items {
                let Some(message_id) = message_reference(&item.value) else {
                    continue;
                };

                let Ok(handle) = self.inner.loader.ensure(
                    message_id.as_str(),
                    true,
                    self.inner.config.inbox.message_timeout_ms,
                ) else {
                    debug!(actor = actor_id, message = %message_id, "message not loadable; skipped");
                    continue;
                };
                let Some(record) = extract(&handle, None, meta.as_ref()) else {
                    continue;
                };

                if is_system_message(&record) {
                    continue;
                }
                if record.get("processed") == Some(&Value::Bool(true)) {
                    continue;
                }

                // Mark processed before delivery: the ordering point for
                // at-most-once semantics.
                if let Err(err) = self.update(
                    "event",
                    message_id.as_str(),
                    json!({ "processed": true }),
                ) {
                    warn!(message = %message_id, %err, "could not mark processed; withholding");
                    continue;
                }
                self.verify_processed(&message_id);

                let mut message = Map::new();
                for (key, value) in record.as_object().into_iter().flatten() {
                    if !is_internal_key(key) {
                        message.insert(key.clone(), value.clone());
                    }
                }
                let Some(message_type) = message.get("type").and_then(Value::as_str) else {
                    continue;
                };
                if message_type == "REMOVE_MEMBER" {
                    let member = message
                        .get("payload")
                        .and_then(|p| p.get("memberId"))
                        .and_then(CoId::from_value);
                    if member.is_none() {
                        continue;
                    }
                }

                message.insert("_coId".to_string(), json!(message_id.as_str()));
                message.insert("_sessionID".to_string(), Value::String(session_id.clone()));
                message.insert("_madeAt".to_string(), json!(item.made_at));
                delivered.push(Value::Object(message));
            }
        }

        delivered.sort_by_key(|message| {
            message
                .get("_madeAt")
                .and_then(Value::as_i64)
                .unwrap_or(i64::MAX)
        });
        Ok(json!({ "messages": delivered }))
    }

    /// Bounded verification of the processed mark; logs but never fails.
    fn verify_processed(&self, message_id: &CoId) {
        let verified = self
            .inner
            .loader
            .ensure(
                message_id.as_str(),
                true,
                self.inner.config.inbox.verify_timeout_ms,
            )
            .ok()
            .and_then(|handle| handle.get("processed"))
            .map(|processed| processed == Value::Bool(true))
            .unwrap_or(false);
        if !verified {
            warn!(message = %message_id, "processed mark did not verify");
        }
    }
}

/// Resolves a stream item to its message reference. Items are co-id
/// strings or objects carrying `_coId`; inline system markers and legacy
/// inline objects are rejected silently.
fn message_reference(item: &Value) -> Option<CoId> {
    match item {
        Value::String(_) => CoId::from_value(item),
        Value::Object(obj) => {
            if obj.get("type").and_then(Value::as_str) == Some("INIT")
                || obj.get("from").and_then(Value::as_str) == Some("system")
            {
                return None;
            }
            obj.get("_coId").and_then(CoId::from_value)
        }
        _ => None,
    }
}

/// System messages are never delivered.
fn is_system_message(record: &Value) -> bool {
    record.get("type").and_then(Value::as_str) == Some("INIT")
        || record.get("from").and_then(Value::as_str) == Some("system")
}
