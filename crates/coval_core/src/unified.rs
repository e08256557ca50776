//! Unified stores: records with embedded query objects.
//!
//! A query object (`{schema, filter?, options?, map?}`) inside a record is a
//! reactive subquery. The unified store subscribes to the raw record store
//! and to a child read store per query key, then emits the record with each
//! query key replaced by its resolved value. Child updates are coalesced:
//! at most one emission per scheduler drain, and JSON-equivalent emissions
//! are suppressed entirely.

use crate::co_id::CoId;
use crate::engine::Engine;
use crate::read::ReadOptions;
use crate::store::{ReadState, Store, StoreSubscription};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Field names that are schema-definition structure, never queries.
const SCHEMA_DEFINITION_FIELDS: [&str; 7] = [
    "properties",
    "items",
    "$defs",
    "cotype",
    "indexing",
    "title",
    "description",
];

/// Whether a record value is a query object under the given key.
///
/// A query object is a non-array object with a `schema` property. Records
/// carrying an `op` outside `{read, query}` are DB-operation payloads, not
/// queries; schema-definition fields are structural regardless of shape.
pub fn is_query_object(key: &str, value: &Value) -> bool {
    if SCHEMA_DEFINITION_FIELDS.contains(&key) {
        return false;
    }
    let Some(obj) = value.as_object() else {
        return false;
    };
    if !obj.get("schema").map(Value::is_string).unwrap_or(false) {
        return false;
    }
    match obj.get("op") {
        None => true,
        Some(op) => matches!(op.as_str(), Some("read") | Some("query")),
    }
}

/// Whether any top-level value of a record is a query object.
pub fn has_query_objects(record: &Value) -> bool {
    record
        .as_object()
        .map(|obj| obj.iter().any(|(key, value)| is_query_object(key, value)))
        .unwrap_or(false)
}

/// findOne detection: a filter of exactly the shape `{id: <coId>}`.
fn find_one_id(filter: &Value) -> Option<CoId> {
    let obj = filter.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get("id").and_then(CoId::from_value)
}

struct Child {
    def: Value,
    find_one: bool,
    /// Resolved child read store; `None` until the schema resolves.
    store: Option<Store<ReadState>>,
    guards: Vec<StoreSubscription<ReadState>>,
}

struct UnifiedState {
    context: Value,
    children: HashMap<String, Child>,
    last: Option<Value>,
    pending_emit: bool,
}

impl Engine {
    /// Wraps a record store into a unified store that merges resolved
    /// query results into the record.
    pub fn unify(&self, context: Store<ReadState>, opts: &ReadOptions) -> Store<ReadState> {
        let out: Store<ReadState> = Store::new(ReadState::Loading);
        let state = Rc::new(RefCell::new(UnifiedState {
            context: Value::Null,
            children: HashMap::new(),
            last: None,
            pending_emit: false,
        }));

        let weak_engine = self.downgrade();
        let weak_out = out.downgrade();
        let sub_state = Rc::clone(&state);
        let sub_opts = opts.clone();
        let context_sub = context.subscribe(move |read_state: &ReadState| {
            let (Some(engine), Some(out)) = (weak_engine.upgrade(), weak_out.upgrade()) else {
                return;
            };
            match read_state {
                ReadState::Ready(value) => {
                    sub_state.borrow_mut().context = value.clone();
                    engine.sync_children(&sub_state, &out, &sub_opts);
                    engine.schedule_unified_emit(&sub_state, &out);
                }
                ReadState::Error { id, message } => out.set(ReadState::Error {
                    id: id.clone(),
                    message: message.clone(),
                }),
                ReadState::Loading => {}
            }
        });
        out.retain(context_sub);
        out.retain(context.clone());
        out.retain(Rc::clone(&state));

        // Prime from the current context value; the first emission is
        // synchronous so callers see a merged record immediately.
        match context.get() {
            ReadState::Ready(value) => {
                state.borrow_mut().context = value;
                self.sync_children(&state, &out, opts);
                self.emit_unified(&state, &out);
            }
            ReadState::Error { id, message } => out.set(ReadState::Error { id, message }),
            ReadState::Loading => {}
        }
        out
    }

    /// Creates and removes child query stores to match the context record.
    fn sync_children(
        &self,
        state: &Rc<RefCell<UnifiedState>>,
        out: &Store<ReadState>,
        opts: &ReadOptions,
    ) {
        let context = state.borrow().context.clone();
        let Some(obj) = context.as_object() else {
            return;
        };

        let query_keys: Vec<(String, Value)> = obj
            .iter()
            .filter(|(key, value)| is_query_object(key, value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        // Drop children whose query disappeared from the record.
        state
            .borrow_mut()
            .children
            .retain(|key, _| query_keys.iter().any(|(k, _)| k == key));

        for (key, def) in query_keys {
            let unchanged = state
                .borrow()
                .children
                .get(&key)
                .map(|child| child.def == def)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            let child = self.build_child(state, out, opts, &context, &def);
            state.borrow_mut().children.insert(key, child);
        }
    }

    /// Builds one child query pipeline.
    fn build_child(
        &self,
        state: &Rc<RefCell<UnifiedState>>,
        out: &Store<ReadState>,
        opts: &ReadOptions,
        context: &Value,
        def: &Value,
    ) -> Child {
        // Filters are expressions evaluated against the parent record.
        let eval_context = json!({ "context": context, "item": {} });
        let filter = def
            .get("filter")
            .map(|expr| self.evaluator().eval(expr, &eval_context));

        let mut child_opts = match def.get("options") {
            Some(options) => ReadOptions::from_value(Some(options), &self.inner.config.read),
            None => opts.clone(),
        };
        if let Some(map) = def.get("map").and_then(Value::as_object) {
            child_opts.map = Some(map.clone());
        }

        let mut child = Child {
            def: def.clone(),
            find_one: false,
            store: None,
            guards: Vec::new(),
        };

        if let Some(id) = filter.as_ref().and_then(find_one_id) {
            child.find_one = true;
            let store = self.read_co_value(id.as_str(), None, &child_opts);
            child.guards.push(self.pipe_child(state, out, &store));
            child.store = Some(store);
            return child;
        }

        let Some(schema_key) = def.get("schema").and_then(Value::as_str) else {
            return child;
        };

        match self.inner.index.resolve_schema(schema_key) {
            Some(schema) => {
                let store =
                    self.read_collection(schema.as_str(), filter.clone(), &child_opts);
                child.guards.push(self.pipe_child(state, out, &store));
                child.store = Some(store);
            }
            None => {
                // Upgrade reactively once the registry learns the key.
                trace!(schema = schema_key, "query schema pending resolution");
                let schema_store = self.resolve_schema_reactive(schema_key);
                let weak_engine = self.downgrade();
                let weak_out = out.downgrade();
                let state_rc = Rc::clone(state);
                let def = def.clone();
                let filter = filter.clone();
                let late_key = query_key_for(&state_rc, &def);
                let sub = schema_store.subscribe(move |resolve| {
                    let Some(schema) = resolve.schema.clone() else {
                        return;
                    };
                    let (Some(engine), Some(out)) = (weak_engine.upgrade(), weak_out.upgrade())
                    else {
                        return;
                    };
                    let store = engine.read_collection(
                        schema.as_str(),
                        filter.clone(),
                        &child_opts,
                    );
                    let pipe = engine.pipe_child(&state_rc, &out, &store);
                    if let Some(key) = &late_key {
                        if let Some(child) = state_rc.borrow_mut().children.get_mut(key) {
                            child.guards.push(pipe);
                            child.store = Some(store);
                        }
                    }
                    engine.schedule_unified_emit(&state_rc, &out);
                });
                out.retain(sub);
                out.retain(schema_store);
            }
        }
        child
    }

    /// Subscribes a child store into the batched emit queue.
    fn pipe_child(
        &self,
        state: &Rc<RefCell<UnifiedState>>,
        out: &Store<ReadState>,
        child: &Store<ReadState>,
    ) -> StoreSubscription<ReadState> {
        let weak_engine = self.downgrade();
        let weak_out = out.downgrade();
        let state = Rc::clone(state);
        child.subscribe(move |_| {
            let (Some(engine), Some(out)) = (weak_engine.upgrade(), weak_out.upgrade()) else {
                return;
            };
            engine.schedule_unified_emit(&state, &out);
        })
    }

    /// Coalesces updates: one queued emit per drain, at most.
    fn schedule_unified_emit(&self, state: &Rc<RefCell<UnifiedState>>, out: &Store<ReadState>) {
        {
            let mut state = state.borrow_mut();
            if state.pending_emit {
                return;
            }
            state.pending_emit = true;
        }
        let weak_engine = self.downgrade();
        let weak_out = out.downgrade();
        let state = Rc::clone(state);
        self.inner.scheduler.enqueue(move || {
            state.borrow_mut().pending_emit = false;
            let (Some(engine), Some(out)) = (weak_engine.upgrade(), weak_out.upgrade()) else {
                return;
            };
            engine.emit_unified(&state, &out);
        });
    }

    /// Assembles and emits the merged record, suppressing JSON-equivalent
    /// emissions.
    fn emit_unified(&self, state: &Rc<RefCell<UnifiedState>>, out: &Store<ReadState>) {
        let merged = {
            let state = state.borrow();
            let Some(context) = state.context.as_object() else {
                return;
            };
            let mut merged = context.clone();
            merged.remove("@stores");

            let mut op_map = Map::new();
            for (key, child) in &state.children {
                op_map.insert(key.clone(), child.def.clone());
                let resolved = child_value(child);

                if let Some(has_key) = derived_has_key(context, key) {
                    merged.insert(has_key, Value::Bool(value_is_populated(&resolved)));
                }
                merged.insert(key.clone(), resolved);
            }
            // Any query object that slipped past child construction must
            // not reach consumers as a raw object.
            for (key, value) in merged.iter_mut() {
                if is_query_object(key, value) {
                    *value = json!([]);
                }
            }
            merged.insert("$op".to_string(), Value::Object(op_map));
            Value::Object(merged)
        };

        let mut state = state.borrow_mut();
        if state.last.as_ref() == Some(&merged) {
            return;
        }
        state.last = Some(merged.clone());
        drop(state);
        out.set(ReadState::Ready(merged));
    }
}

/// The resolved replacement for a query key.
fn child_value(child: &Child) -> Value {
    let Some(store) = &child.store else {
        return json!([]);
    };
    match store.get() {
        ReadState::Ready(value) => {
            if child.find_one {
                if value.is_object() {
                    value
                } else {
                    Value::Null
                }
            } else {
                value
            }
        }
        _ => {
            if child.find_one {
                Value::Null
            } else {
                json!([])
            }
        }
    }
}

/// `has<Key>` derived boolean, emitted only when the context declared it.
fn derived_has_key(context: &Map<String, Value>, key: &str) -> Option<String> {
    let mut chars = key.chars();
    let first = chars.next()?;
    let has_key = format!("has{}{}", first.to_uppercase(), chars.as_str());
    context.contains_key(&has_key).then_some(has_key)
}

fn value_is_populated(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Null => false,
        Value::Object(_) => true,
        _ => true,
    }
}

/// Finds the context key a query definition belongs to.
fn query_key_for(state: &Rc<RefCell<UnifiedState>>, def: &Value) -> Option<String> {
    state
        .borrow()
        .context
        .as_object()?
        .iter()
        .find(|(_, value)| *value == def)
        .map(|(key, _)| key.clone())
}
