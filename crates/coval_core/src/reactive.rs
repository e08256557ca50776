//! Reactive resolution of schema keys, co-ids, and query objects.
//!
//! These resolvers turn identifiers into stores that update as their
//! dependencies resolve: a schema key emits once the OS schematas registry
//! learns it, a co-id emits once the co-value becomes available, a query
//! object composes schema resolution with a collection read.

use crate::co_id::CoId;
use crate::engine::Engine;
use crate::peer::CoHandle;
use crate::read::ReadOptions;
use crate::schema::normalize_schema_key;
use crate::store::{ReadState, Store};
use serde_json::{json, Value};
use std::rc::Rc;

/// Key of the schema registry inside the OS map.
const SCHEMATAS_KEY: &str = "schematas";

/// Progressive result of a reactive schema resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaResolve {
    /// Whether resolution is still underway.
    pub loading: bool,
    /// The resolved schema co-id.
    pub schema: Option<CoId>,
    /// Terminal failure description.
    pub error: Option<String>,
}

impl SchemaResolve {
    fn loading() -> Self {
        Self {
            loading: true,
            schema: None,
            error: None,
        }
    }

    fn done(schema: CoId) -> Self {
        Self {
            loading: false,
            schema: Some(schema),
            error: None,
        }
    }
}

/// Progressive result of a reactive co-value resolution.
#[derive(Clone)]
pub struct CoValueResolve {
    /// Whether the co-value is still loading.
    pub loading: bool,
    /// The available handle.
    pub handle: Option<CoHandle>,
    /// Terminal failure description.
    pub error: Option<String>,
}

/// Progressive result of a reactive query resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResolve {
    /// Whether the query is still resolving its schema.
    pub loading: bool,
    /// Resolved items; grows progressively.
    pub items: Value,
}

impl Engine {
    /// Resolves a schema key reactively. Co-ids resolve immediately;
    /// human-readable keys wait on the OS schematas registry.
    pub fn resolve_schema_reactive(&self, key: &str) -> Store<SchemaResolve> {
        if let Ok(id) = CoId::parse(key) {
            return Store::new(SchemaResolve::done(id));
        }
        if let Some(id) = self.inner.schemas.resolve(key) {
            return Store::new(SchemaResolve::done(id));
        }

        let store = Store::new(SchemaResolve::loading());
        let key = key.to_string();

        let weak_engine = self.downgrade();
        let weak_store = store.downgrade();
        let check_key = key.clone();
        let check = Rc::new(move || {
            let (Some(engine), Some(store)) = (weak_engine.upgrade(), weak_store.upgrade())
            else {
                return;
            };
            if !store.get().loading {
                return;
            }
            if let Some(id) = engine.lookup_schema_key(&check_key) {
                store.set(SchemaResolve::done(id));
            }
        });

        // Watch the OS map, then its schematas registry.
        let os_id = self.inner.os.clone();
        let os_check = Rc::clone(&check);
        let os_sub = self
            .inner
            .peer
            .subscribe(&os_id, Rc::new(move |_: &CoHandle| os_check()));
        store.retain(os_sub);

        if let Some(registry_id) = self.schematas_registry_id() {
            let registry_check = Rc::clone(&check);
            let registry_sub = self
                .inner
                .peer
                .subscribe(&registry_id, Rc::new(move |_: &CoHandle| registry_check()));
            store.retain(registry_sub);
            self.inner.peer.load(&registry_id);
        }
        self.inner.peer.load(&os_id);

        check();
        store
    }

    /// Resolves a co-value reactively: emits once it becomes available.
    pub fn resolve_co_value_reactive(&self, id: &CoId) -> Store<CoValueResolve> {
        let handle = self.inner.peer.entry(id);
        if handle.is_available() {
            return Store::new(CoValueResolve {
                loading: false,
                handle: Some(handle),
                error: None,
            });
        }

        let store = Store::new(CoValueResolve {
            loading: true,
            handle: None,
            error: None,
        });
        let weak_store = store.downgrade();
        let sub = self.inner.peer.subscribe(
            id,
            Rc::new(move |handle: &CoHandle| {
                let Some(store) = weak_store.upgrade() else {
                    return;
                };
                if handle.is_available() && store.get().loading {
                    store.set(CoValueResolve {
                        loading: false,
                        handle: Some(handle.clone()),
                        error: None,
                    });
                }
            }),
        );
        store.retain(sub);
        self.inner.peer.load(id);
        store
    }

    /// Resolves a query reactively: schema resolution composed with a
    /// collection read.
    pub fn resolve_query_reactive(
        &self,
        schema_key: &str,
        filter: Option<Value>,
        options: Option<&Value>,
    ) -> Store<QueryResolve> {
        let opts = ReadOptions::from_value(options, &self.inner.config.read);
        let store = Store::new(QueryResolve {
            loading: true,
            items: json!([]),
        });

        let schema_store = self.resolve_schema_reactive(schema_key);
        let weak_engine = self.downgrade();
        let weak_store = store.downgrade();
        let wire = {
            let weak_store = weak_store.clone();
            move |engine: &Engine, schema: &CoId| {
                let Some(store) = weak_store.upgrade() else {
                    return;
                };
                let read = engine.read_collection(schema.as_str(), filter.clone(), &opts);
                let pipe_store = weak_store.clone();
                let pipe = read.subscribe(move |state: &ReadState| {
                    let Some(store) = pipe_store.upgrade() else {
                        return;
                    };
                    if let Some(items) = state.value() {
                        store.set(QueryResolve {
                            loading: false,
                            items: items.clone(),
                        });
                    }
                });
                store.retain(pipe);
                if let Some(items) = read.get().value() {
                    store.set(QueryResolve {
                        loading: false,
                        items: items.clone(),
                    });
                }
                store.retain(read);
            }
        };

        match schema_store.get() {
            SchemaResolve {
                schema: Some(schema),
                ..
            } => wire(self, &schema),
            _ => {
                let sub = schema_store.subscribe(move |resolve: &SchemaResolve| {
                    let Some(engine) = weak_engine.upgrade() else {
                        return;
                    };
                    if let Some(schema) = &resolve.schema {
                        wire(&engine, schema);
                    }
                });
                store.retain(sub);
                store.retain(schema_store);
            }
        }
        store
    }

    /// Dispatches an identifier to the matching reactive resolver:
    /// query object, `{fromCoValue}` meta, co-id string, or schema key.
    pub fn resolve_reactive(&self, identifier: &Value) -> Store<ReadState> {
        match identifier {
            Value::Object(obj) => {
                if let Some(schema) = obj.get("schema").and_then(Value::as_str) {
                    let query = self.resolve_query_reactive(
                        schema,
                        obj.get("filter").cloned(),
                        obj.get("options"),
                    );
                    return pipe_query(query);
                }
                if let Some(from) = obj.get("fromCoValue").and_then(Value::as_str) {
                    return self.schema_from_co_value(from);
                }
                Store::new(ReadState::Error {
                    id: None,
                    message: "unrecognized identifier shape".to_string(),
                })
            }
            Value::String(s) if CoId::looks_like(s) => {
                self.read_co_value(s, None, &self.default_read_options())
            }
            Value::String(key) => {
                let schema_store = self.resolve_schema_reactive(key);
                pipe_schema(schema_store)
            }
            _ => Store::new(ReadState::Error {
                id: None,
                message: "unrecognized identifier shape".to_string(),
            }),
        }
    }

    /// The schema document of a co-value's header schema, reactively.
    fn schema_from_co_value(&self, id_str: &str) -> Store<ReadState> {
        let store = Store::new(ReadState::Loading);
        let Ok(id) = CoId::parse(id_str) else {
            store.set(ReadState::Error {
                id: None,
                message: format!("invalid co-id: {id_str}"),
            });
            return store;
        };

        let weak_engine = self.downgrade();
        let weak_store = store.downgrade();
        let emit: Rc<dyn Fn(&CoHandle)> = Rc::new(move |handle: &CoHandle| {
            let (Some(engine), Some(store)) = (weak_engine.upgrade(), weak_store.upgrade())
            else {
                return;
            };
            let Some(schema) = handle.header().and_then(|h| h.schema) else {
                return;
            };
            let Some(doc) = engine.inner.schemas.document(&schema) else {
                return;
            };
            match serde_json::to_value(&doc) {
                Ok(doc) => store.set(ReadState::Ready(doc)),
                Err(err) => store.set(ReadState::Error {
                    id: Some(schema),
                    message: err.to_string(),
                }),
            }
        });

        let sub = self.inner.peer.subscribe(&id, Rc::clone(&emit));
        store.retain(sub);
        emit(&self.inner.peer.entry(&id));
        self.inner.peer.load(&id);
        store
    }

    /// Consults the resolver first, then the OS schematas registry, under
    /// the normalized key form.
    fn lookup_schema_key(&self, key: &str) -> Option<CoId> {
        if let Some(id) = self.inner.schemas.resolve(key) {
            return Some(id);
        }
        let registry_id = self.schematas_registry_id()?;
        let registry = self.inner.peer.entry(&registry_id);
        if !registry.is_available() {
            self.inner.peer.load(&registry_id);
            return None;
        }
        let normalized = normalize_schema_key(key);
        registry
            .get(key)
            .or_else(|| registry.get(normalized))
            .and_then(|v| CoId::from_value(&v))
    }

    fn schematas_registry_id(&self) -> Option<CoId> {
        let os = self.inner.peer.entry(&self.inner.os);
        if !os.is_available() {
            self.inner.peer.load(&self.inner.os);
            return None;
        }
        os.get(SCHEMATAS_KEY).and_then(|v| CoId::from_value(&v))
    }
}

/// Pipes a query-resolve store into the uniform read-state shape.
fn pipe_query(query: Store<QueryResolve>) -> Store<ReadState> {
    let out = Store::new(ReadState::Loading);
    let weak_out = out.downgrade();
    let sub = query.subscribe(move |resolve: &QueryResolve| {
        if let Some(out) = weak_out.upgrade() {
            out.set(ReadState::Ready(resolve.items.clone()));
        }
    });
    out.retain(sub);
    let current = query.get();
    if !current.loading {
        out.set(ReadState::Ready(current.items));
    }
    out.retain(query);
    out
}

/// Pipes a schema-resolve store into the uniform read-state shape.
fn pipe_schema(schema_store: Store<SchemaResolve>) -> Store<ReadState> {
    let out = Store::new(ReadState::Loading);
    let weak_out = out.downgrade();
    let emit = move |resolve: &SchemaResolve| {
        let Some(out) = weak_out.upgrade() else {
            return;
        };
        if let Some(schema) = &resolve.schema {
            out.set(ReadState::Ready(json!({ "schemaCoId": schema.as_str() })));
        } else if let Some(error) = &resolve.error {
            out.set(ReadState::Error {
                id: None,
                message: error.clone(),
            });
        }
    };
    emit(&schema_store.get());
    let sub = schema_store.subscribe(emit.clone());
    out.retain(sub);
    out.retain(schema_store);
    out
}
