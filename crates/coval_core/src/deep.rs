//! Progressive resolution of references embedded in records.
//!
//! Every reference reachable in a record is expanded in place: available
//! co-values are extracted and recursed into, unavailable ones get a load
//! triggered and are reported so the read path can subscribe and re-resolve
//! when they arrive. The caller is never blocked past the root co-value.
//!
//! A shared visited set breaks cycles: a reference that was already
//! expanded in this pass collapses to an `{id}` stub.

use crate::co_id::CoId;
use crate::extract::extract;
use crate::peer::Peer;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::trace;

/// References touched during one resolution pass.
#[derive(Debug, Default)]
pub struct DeepOutcome {
    /// References expanded into the record. Sticky subscriptions keep
    /// them resident and re-resolve on change.
    pub resolved: Vec<CoId>,
    /// References not yet available; loads have been triggered.
    pub pending: Vec<CoId>,
}

impl DeepOutcome {
    fn note_resolved(&mut self, id: &CoId) {
        if !self.resolved.contains(id) {
            self.resolved.push(id.clone());
        }
    }

    fn note_pending(&mut self, id: &CoId) {
        if !self.pending.contains(id) {
            self.pending.push(id.clone());
        }
    }
}

/// Expands references in `value` in place, up to `max_depth`.
///
/// `visited` must already contain the root co-value's id so self-references
/// collapse to stubs. Metadata keys (`id`, keys starting with `$` or `_`)
/// are never treated as references.
pub fn resolve_refs(
    peer: &Rc<dyn Peer>,
    meta_schema: Option<&CoId>,
    value: &mut Value,
    max_depth: usize,
    visited: &mut HashSet<CoId>,
    outcome: &mut DeepOutcome,
) {
    resolve_at(peer, meta_schema, value, 0, max_depth, visited, outcome);
}

fn resolve_at(
    peer: &Rc<dyn Peer>,
    meta_schema: Option<&CoId>,
    value: &mut Value,
    depth: usize,
    max_depth: usize,
    visited: &mut HashSet<CoId>,
    outcome: &mut DeepOutcome,
) {
    match value {
        Value::Object(obj) => {
            for (key, nested) in obj.iter_mut() {
                if key == "id" || key.starts_with('$') || key.starts_with('_') {
                    continue;
                }
                resolve_at(peer, meta_schema, nested, depth, max_depth, visited, outcome);
            }
        }
        Value::Array(items) => {
            for nested in items.iter_mut() {
                resolve_at(peer, meta_schema, nested, depth, max_depth, visited, outcome);
            }
        }
        Value::String(_) => {
            let Some(id) = CoId::from_value(value) else {
                return;
            };
            if depth >= max_depth {
                trace!(id = %id, depth, "deep resolution depth bound reached");
                return;
            }
            // Visited before any I/O: cycles collapse to a stub.
            if !visited.insert(id.clone()) {
                *value = json!({ "id": id.as_str() });
                return;
            }

            let handle = peer.entry(&id);
            if !handle.is_available() {
                peer.load(&id);
                outcome.note_pending(&id);
                return;
            }
            let Some(mut expanded) = extract(&handle, None, meta_schema) else {
                return;
            };
            outcome.note_resolved(&id);
            resolve_at(
                peer,
                meta_schema,
                &mut expanded,
                depth + 1,
                max_depth,
                visited,
                outcome,
            );
            *value = expanded;
        }
        _ => {}
    }
}
