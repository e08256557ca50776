//! Reactive read paths: single co-values, collections, registries, all.
//!
//! Read paths never throw. A single read emits `Loading` synchronously and
//! transitions to `Ready`/`Error`; collection stores start at `Ready([])`
//! and grow progressively as items load. Projected records are memoized per
//! `(coId, options)` and invalidated when the co-value or anything embedded
//! in it changes.

use crate::cache::keys;
use crate::co_id::CoId;
use crate::config::ReadConfig;
use crate::deep::{resolve_refs, DeepOutcome};
use crate::engine::Engine;
use crate::extract::{extract, is_empty_skeleton};
use crate::index::dedup_ids;
use crate::map_transform::{apply_map, MapOutcome};
use crate::peer::{CoHandle, CoKind};
use crate::schema::normalize_schema_key;
use crate::store::{ReadState, Store, WeakStore};
use crate::unified::has_query_objects;
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// Options for a read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Whether references are progressively deep-resolved.
    pub deep_resolve: bool,
    /// Depth bound for reference resolution.
    pub max_depth: usize,
    /// Availability budget for the root co-value.
    pub timeout_ms: u64,
    /// Optional projection map applied after extraction.
    pub map: Option<Map<String, Value>>,
}

impl ReadOptions {
    /// Defaults from a read configuration section.
    pub fn from_config(config: &ReadConfig) -> Self {
        Self {
            deep_resolve: config.deep_resolve,
            max_depth: config.max_depth,
            timeout_ms: config.timeout_ms,
            map: None,
        }
    }

    /// Parses wire options (`{deepResolve, maxDepth, timeoutMs, map}`),
    /// falling back to configured defaults per field.
    pub fn from_value(options: Option<&Value>, config: &ReadConfig) -> Self {
        let mut opts = Self::from_config(config);
        let Some(options) = options.and_then(Value::as_object) else {
            return opts;
        };
        if let Some(deep) = options.get("deepResolve").and_then(Value::as_bool) {
            opts.deep_resolve = deep;
        }
        if let Some(depth) = options.get("maxDepth").and_then(Value::as_u64) {
            opts.max_depth = depth as usize;
        }
        if let Some(timeout) = options.get("timeoutMs").and_then(Value::as_u64) {
            opts.timeout_ms = timeout;
        }
        if let Some(map) = options.get("map").and_then(Value::as_object) {
            opts.map = Some(map.clone());
        }
        opts
    }

    /// Structural key for memoization and store interning.
    pub fn options_key(&self) -> String {
        let map = self
            .map
            .as_ref()
            .map(|m| Value::Object(m.clone()).to_string())
            .unwrap_or_default();
        format!(
            "deep={}:depth={}:timeout={}:map={}",
            self.deep_resolve, self.max_depth, self.timeout_ms, map
        )
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::from_config(&ReadConfig::default())
    }
}

/// A uniform read request, mirroring the gate's `{op: "read"}` record.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    /// Single co-value read.
    pub co_id: Option<String>,
    /// Collection (or registry) read by schema.
    pub schema: Option<String>,
    /// Per-key strict-equality filter.
    pub filter: Option<Value>,
    /// Schema attribution hint for extraction.
    pub hint: Option<String>,
    /// Read options.
    pub options: ReadOptions,
}

/// Strict per-key equality on top-level keys; a record array value matches
/// when any element equals the filter value. No coercion.
pub fn matches_filter(record: &Value, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return true;
    };
    if filter.is_empty() {
        return true;
    }
    let Some(record) = record.as_object() else {
        return false;
    };
    filter.iter().all(|(key, expected)| match record.get(key) {
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| item == expected)
        }
        Some(actual) => actual == expected,
        None => false,
    })
}

enum ListingSource {
    IndexList(CoId),
    Registry(String),
    All,
}

/// Shared state of one listing store (collection, registry, or all-read).
pub(crate) struct ListingCtx {
    source: ListingSource,
    filter: Value,
    opts: ReadOptions,
    subscribed: RefCell<HashSet<CoId>>,
    store: WeakStore<ReadState>,
}

impl Engine {
    /// Universal read dispatch: single co-value, registry, collection, or
    /// all records.
    pub fn read(&self, req: ReadRequest) -> Store<ReadState> {
        if let Some(co_id) = &req.co_id {
            return self.read_co_value(co_id, req.hint.as_deref(), &req.options);
        }
        if let Some(schema) = &req.schema {
            let normalized = normalize_schema_key(schema);
            let registries = &self.inner.config.registries;
            if normalized == registries.sparks || normalized == registries.humans {
                return self.read_registry(normalized, req.filter, &req.options);
            }
            return self.read_collection(schema, req.filter, &req.options);
        }
        self.read_all(req.filter, &req.options)
    }

    /// Reads one co-value into a reactive store.
    pub fn read_co_value(
        &self,
        id_str: &str,
        hint: Option<&str>,
        opts: &ReadOptions,
    ) -> Store<ReadState> {
        let store = Store::new(ReadState::Loading);
        let id = match CoId::parse(id_str) {
            Ok(id) => id,
            Err(err) => {
                store.set(ReadState::Error {
                    id: None,
                    message: err.to_string(),
                });
                return store;
            }
        };

        // Served from memo when present; subscriptions are wired anyway.
        if let Some(memo) = self.inner.cache.get_resolved_data(&id, &opts.options_key()) {
            store.set(ReadState::Ready(memo));
        }

        self.install_invalidation_subscription(&id);

        let weak_engine = self.downgrade();
        let weak_store = store.downgrade();
        let sub_id = id.clone();
        let sub_hint = hint.map(str::to_string);
        let sub_opts = opts.clone();
        let sub = self.inner.peer.subscribe(
            &id,
            Rc::new(move |handle: &CoHandle| {
                let (Some(engine), Some(store)) = (weak_engine.upgrade(), weak_store.upgrade())
                else {
                    return;
                };
                if !handle.is_available() {
                    return;
                }
                if let Some(record) =
                    engine.process_co_value_data(&sub_id, handle, sub_hint.as_deref(), &sub_opts)
                {
                    store.set(ReadState::Ready(record));
                }
            }),
        );
        store.retain(sub);

        // The single bounded wait of a read is on the root co-value.
        match self.inner.loader.ensure(id_str, true, opts.timeout_ms) {
            Ok(handle) => {
                if let Some(record) = self.process_co_value_data(&id, &handle, hint, opts) {
                    store.set(ReadState::Ready(record));
                }
            }
            Err(err) => {
                if store.get().is_loading() {
                    store.set(ReadState::Error {
                        id: Some(id.clone()),
                        message: err.to_string(),
                    });
                }
            }
        }

        // Records containing query objects are served through a unified
        // store that merges resolved query results in.
        let wraps = store
            .with(|state| state.value().map(has_query_objects).unwrap_or(false));
        if wraps {
            return self.unify(store, opts);
        }
        store
    }

    /// Reads a schema's collection through its index list.
    pub fn read_collection(
        &self,
        schema_key: &str,
        filter: Option<Value>,
        opts: &ReadOptions,
    ) -> Store<ReadState> {
        let Some(schema) = self.inner.index.resolve_schema(schema_key) else {
            let store = Store::new(ReadState::Error {
                id: None,
                message: format!("schema unresolved: {schema_key}"),
            });
            return store;
        };

        let filter = filter.unwrap_or_else(|| json!({}));
        let store_key = keys::store(&schema, &filter.to_string(), &opts.options_key());
        if let Some(existing) = self.inner.cache.store(&store_key) {
            return existing;
        }
        let store = self
            .inner
            .cache
            .get_or_create_store(&store_key, ReadState::Ready(json!([])));

        let Some(list_id) = self.inner.index.index_list_for(&schema) else {
            return store;
        };

        let ctx = Rc::new(ListingCtx {
            source: ListingSource::IndexList(list_id),
            filter,
            opts: opts.clone(),
            subscribed: RefCell::new(HashSet::new()),
            store: store.downgrade(),
        });
        self.recompute_listing(&ctx);
        store
    }

    /// Reads an account registry (sparks or humans).
    pub fn read_registry(
        &self,
        name: &str,
        filter: Option<Value>,
        opts: &ReadOptions,
    ) -> Store<ReadState> {
        let filter = filter.unwrap_or_else(|| json!({}));
        let store_key = format!(
            "store:@registry:{name}:{}:{}",
            filter,
            opts.options_key()
        );
        if let Some(existing) = self.inner.cache.store(&store_key) {
            return existing;
        }
        let store = self
            .inner
            .cache
            .get_or_create_store(&store_key, ReadState::Ready(json!([])));

        let ctx = Rc::new(ListingCtx {
            source: ListingSource::Registry(name.to_string()),
            filter,
            opts: opts.clone(),
            subscribed: RefCell::new(HashSet::new()),
            store: store.downgrade(),
        });
        self.recompute_listing(&ctx);
        store
    }

    /// Reads all map-shaped co-values known to the peer.
    pub fn read_all(&self, filter: Option<Value>, opts: &ReadOptions) -> Store<ReadState> {
        let filter = filter.unwrap_or_else(|| json!({}));
        let store_key = format!("store:@all:{}:{}", filter, opts.options_key());
        if let Some(existing) = self.inner.cache.store(&store_key) {
            return existing;
        }
        let store = self
            .inner
            .cache
            .get_or_create_store(&store_key, ReadState::Ready(json!([])));

        let ctx = Rc::new(ListingCtx {
            source: ListingSource::All,
            filter,
            opts: opts.clone(),
            subscribed: RefCell::new(HashSet::new()),
            store: store.downgrade(),
        });
        self.inner
            .all_listings
            .borrow_mut()
            .push(Rc::downgrade(&ctx));
        self.recompute_listing(&ctx);
        store
    }

    /// Recomputes every live all-listing. Called from the engine's write
    /// hook when a brand-new co-value is created or delivered.
    pub(crate) fn refresh_all_listings(&self) {
        let listings: Vec<std::rc::Weak<ListingCtx>> =
            self.inner.all_listings.borrow().clone();
        let mut alive = Vec::with_capacity(listings.len());
        for weak_ctx in listings {
            if let Some(ctx) = weak_ctx.upgrade() {
                self.recompute_listing(&ctx);
                alive.push(weak_ctx);
            }
        }
        *self.inner.all_listings.borrow_mut() = alive;
    }

    /// Extracts, resolves, and projects one co-value, memoizing the result
    /// and wiring dependency subscriptions for every reference touched.
    pub(crate) fn process_co_value_data(
        &self,
        id: &CoId,
        handle: &CoHandle,
        hint: Option<&str>,
        opts: &ReadOptions,
    ) -> Option<Value> {
        let opts_key = opts.options_key();
        if let Some(memo) = self.inner.cache.get_resolved_data(id, &opts_key) {
            return Some(memo);
        }

        let meta = self.inner.schemas.meta_schema();
        let mut visited: HashSet<CoId> = HashSet::new();
        visited.insert(id.clone());

        let mut record = extract(handle, hint, meta.as_ref())?;
        let mut deps: Vec<CoId> = Vec::new();

        if opts.deep_resolve && opts.map.is_none() {
            let resolution_key = keys::resolution(id);
            self.inner.cache.begin_resolution(&resolution_key);
            let mut outcome = DeepOutcome::default();
            resolve_refs(
                &self.inner.peer,
                meta.as_ref(),
                &mut record,
                opts.max_depth,
                &mut visited,
                &mut outcome,
            );
            if outcome.pending.is_empty() {
                self.inner.cache.complete_resolution(&resolution_key);
                self.inner.cache.mark_resolved(id);
            }
            deps.extend(outcome.resolved);
            deps.extend(outcome.pending);
        }

        if let Some(map) = &opts.map {
            let mut outcome = MapOutcome::default();
            record = apply_map(
                &self.inner.peer,
                meta.as_ref(),
                &record,
                map,
                &mut visited,
                &mut outcome,
            );
            deps.extend(outcome.deps);
            deps.extend(outcome.pending);
        }

        self.inner
            .cache
            .set_resolved_data(id, &opts_key, record.clone(), visited);

        for dep in deps {
            self.install_dependency_subscription(&dep, id);
        }
        Some(record)
    }

    /// One invalidation subscription per co-value: any change drops its
    /// memoized projections.
    pub(crate) fn install_invalidation_subscription(&self, id: &CoId) {
        let weak = self.downgrade();
        let target = id.clone();
        let peer = Rc::clone(&self.inner.peer);
        self.inner
            .cache
            .hold_subscription(&keys::subscription(id), move || {
                let sub_target = target.clone();
                peer.subscribe(
                    &target,
                    Rc::new(move |_| {
                        if let Some(engine) = weak.upgrade() {
                            engine.inner.cache.invalidate_resolved_data(&sub_target);
                        }
                    }),
                )
            });
    }

    /// One dependency subscription per `(referenced, parent)` pair: when
    /// the referenced co-value changes, the parent's projections are
    /// invalidated and the parent is re-announced so its stores reprocess.
    pub(crate) fn install_dependency_subscription(&self, dep: &CoId, parent: &CoId) {
        if dep == parent {
            return;
        }
        let key = keys::ref_subscription(dep, parent);
        let weak = self.downgrade();
        let dep = dep.clone();
        let parent = parent.clone();
        let peer = Rc::clone(&self.inner.peer);
        self.inner.cache.hold_subscription(&key, move || {
            let sub_dep = dep.clone();
            peer.subscribe(
                &dep,
                Rc::new(move |_| {
                    let Some(engine) = weak.upgrade() else {
                        return;
                    };
                    engine.inner.cache.invalidate_resolved_data(&sub_dep);
                    engine.inner.peer.entry(&parent).touch();
                }),
            )
        });
    }

    /// Rebuilds a listing store from its source, subscribing to containers
    /// and items on first sight.
    fn recompute_listing(&self, ctx: &Rc<ListingCtx>) {
        let Some(store) = ctx.store.upgrade() else {
            return;
        };

        let ids: Vec<CoId> = match &ctx.source {
            ListingSource::IndexList(list_id) => {
                self.watch_container(ctx, list_id);
                let list = self.inner.peer.entry(list_id);
                if !list.is_available() {
                    self.inner.peer.load(list_id);
                    return;
                }
                dedup_ids(&list.list_items())
            }
            ListingSource::Registry(name) => {
                let Some(registry) = self.registry_handle(ctx, name) else {
                    return;
                };
                dedup_ids(
                    &registry
                        .map_entries()
                        .into_iter()
                        .map(|entry| entry.value)
                        .collect::<Vec<_>>(),
                )
            }
            ListingSource::All => self.inner.peer.all_co_values(),
        };

        let mut items: Vec<Value> = Vec::new();
        for item_id in ids {
            self.watch_item(ctx, &item_id);

            let handle = self.inner.peer.entry(&item_id);
            if !handle.is_available() {
                self.inner.peer.load(&item_id);
                continue;
            }
            if handle.kind() != Some(CoKind::Map) {
                continue;
            }
            let Some(record) = self.process_co_value_data(&item_id, &handle, None, &ctx.opts)
            else {
                continue;
            };
            if is_empty_skeleton(&record) {
                continue;
            }
            if !matches_filter(&record, &ctx.filter) {
                continue;
            }
            items.push(record);
        }

        // Snapshot equality: only structural changes emit.
        let next = ReadState::Ready(Value::Array(items));
        if store.get() != next {
            store.set(next);
        }
    }

    /// Subscribes once to a container co-value (index list, registry map),
    /// re-running the listing on change.
    fn watch_container(&self, ctx: &Rc<ListingCtx>, id: &CoId) {
        if !ctx.subscribed.borrow_mut().insert(id.clone()) {
            return;
        }
        let Some(store) = ctx.store.upgrade() else {
            return;
        };
        let weak = self.downgrade();
        let ctx_for_sub = Rc::downgrade(ctx);
        let sub = self.inner.peer.subscribe(
            id,
            Rc::new(move |_| {
                let (Some(engine), Some(ctx)) = (weak.upgrade(), ctx_for_sub.upgrade()) else {
                    return;
                };
                engine.recompute_listing(&ctx);
            }),
        );
        store.retain(sub);
        // The context itself lives as long as the store does.
        store.retain(Rc::clone(ctx));
    }

    /// Subscribes once to a listing item: invalidation first, then a
    /// listing recompute.
    fn watch_item(&self, ctx: &Rc<ListingCtx>, id: &CoId) {
        if ctx.subscribed.borrow().contains(id) {
            return;
        }
        self.install_invalidation_subscription(id);
        self.watch_container(ctx, id);
    }

    /// Resolves the registry comap for a name through
    /// `account.registries.<name>`, watching each hop.
    fn registry_handle(&self, ctx: &Rc<ListingCtx>, name: &str) -> Option<CoHandle> {
        let account_id = self.inner.peer.account();
        self.watch_container(ctx, &account_id);
        let account = self.inner.peer.entry(&account_id);
        if !account.is_available() {
            self.inner.peer.load(&account_id);
            return None;
        }

        let registries_id = account.get("registries").and_then(|v| CoId::from_value(&v))?;
        self.watch_container(ctx, &registries_id);
        let registries = self.inner.peer.entry(&registries_id);
        if !registries.is_available() {
            self.inner.peer.load(&registries_id);
            return None;
        }

        let registry_id = registries.get(name).and_then(|v| CoId::from_value(&v))?;
        self.watch_container(ctx, &registry_id);
        let registry = self.inner.peer.entry(&registry_id);
        if !registry.is_available() {
            self.inner.peer.load(&registry_id);
            return None;
        }
        Some(registry)
    }
}
