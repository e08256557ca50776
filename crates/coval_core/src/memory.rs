//! In-memory reference implementation of the [`Peer`] capability.
//!
//! Suitable for embedding and for tests: co-values live in a "cold" storage
//! map until a load is requested and [`MemoryPeer::pump`] drives it to
//! completion, which mirrors how a networked peer defers availability.
//! Replicated arrivals are simulated with [`MemoryPeer::deliver`].

use crate::co_id::CoId;
use crate::error::{CovalError, Result};
use crate::peer::{
    BinaryBlob, CoContent, CoHandle, CoHeader, CoKind, CreateRequest, MapEntry, Peer,
    PeerCallback, PeerSubscription, StreamItem, ValidationHook, WriteEvent, WriteHook,
};
use crate::TimeProvider;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use uuid::Uuid;

#[derive(Clone)]
struct StoredCoValue {
    header: CoHeader,
    content: CoContent,
}

struct PeerInner {
    handles: RefCell<HashMap<CoId, CoHandle>>,
    storage: RefCell<HashMap<CoId, StoredCoValue>>,
    pending_loads: RefCell<VecDeque<CoId>>,
    held_loads: RefCell<Vec<CoId>>,
    offline: Cell<bool>,
    binaries: RefCell<HashMap<CoId, BinaryBlob>>,
    validation: RefCell<Option<ValidationHook>>,
    write_hooks: RefCell<Vec<WriteHook>>,
    account: CoId,
    session: String,
    time: RefCell<Option<Rc<dyn TimeProvider>>>,
}

/// In-memory peer. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct MemoryPeer {
    inner: Rc<PeerInner>,
}

impl MemoryPeer {
    /// Creates a peer with a fresh account root comap, immediately available.
    pub fn new() -> Self {
        let session = Uuid::new_v4().to_string();
        let account = CoId::from_content(format!("account:{session}").as_bytes());

        let peer = Self {
            inner: Rc::new(PeerInner {
                handles: RefCell::new(HashMap::new()),
                storage: RefCell::new(HashMap::new()),
                pending_loads: RefCell::new(VecDeque::new()),
                held_loads: RefCell::new(Vec::new()),
                offline: Cell::new(false),
                binaries: RefCell::new(HashMap::new()),
                validation: RefCell::new(None),
                write_hooks: RefCell::new(Vec::new()),
                account: account.clone(),
                session,
                time: RefCell::new(None),
            }),
        };

        let handle = peer.entry(&account);
        handle.install(
            CoHeader {
                kind: CoKind::Map,
                schema: None,
                type_hint: Some("account".to_string()),
                ruleset: None,
                spark: None,
                sealed: vec![],
                created_at: peer.now_ms(),
            },
            CoContent::Map(vec![]),
        );
        peer
    }

    /// Injects a controlled clock. Production default is system time.
    pub fn with_time_provider(self, provider: Rc<dyn TimeProvider>) -> Self {
        *self.inner.time.borrow_mut() = Some(provider);
        self
    }

    /// Seeds a co-value into cold storage. It becomes available only after
    /// a [`Peer::load`] request is pumped to completion.
    pub fn seed(&self, schema: Option<CoId>, kind: CoKind, data: Value) -> CoId {
        let created_at = self.now_ms();
        let id = self.mint_id(&schema, kind, created_at, &data);
        let stored = StoredCoValue {
            header: CoHeader {
                kind,
                schema,
                type_hint: None,
                ruleset: None,
                spark: None,
                sealed: vec![],
                created_at,
            },
            content: self.content_from_data(kind, data),
        };
        self.inner.storage.borrow_mut().insert(id.clone(), stored);
        id
    }

    /// Simulates a replicated arrival: the co-value becomes available at
    /// once, subscribers fire, and write hooks observe a replicated write.
    pub fn deliver(&self, schema: Option<CoId>, kind: CoKind, data: Value) -> CoId {
        let created_at = self.now_ms();
        let id = self.mint_id(&schema, kind, created_at, &data);
        let header = CoHeader {
            kind,
            schema: schema.clone(),
            type_hint: None,
            ruleset: None,
            spark: None,
            sealed: vec![],
            created_at,
        };
        let content = self.content_from_data(kind, data);
        self.entry(&id).install(header, content);
        self.announce(WriteEvent {
            id: id.clone(),
            schema,
            kind,
            replicated: true,
        });
        id
    }

    /// Installs a co-value with an explicit header (for header type and
    /// ruleset markers, sealed keys). Immediately available; no write hooks.
    pub fn deliver_with_header(&self, header: CoHeader, data: Value) -> CoId {
        let id = self.mint_id(&header.schema, header.kind, header.created_at, &data);
        let content = self.content_from_data(header.kind, data);
        self.entry(&id).install(header, content);
        id
    }

    /// Simulates late header metadata sync on an already available value.
    pub fn deliver_header_schema(&self, id: &CoId, schema: CoId) {
        self.entry(id).install_header_schema(schema);
    }

    /// Stores a binary payload and returns its co-id.
    pub fn put_binary(&self, mime: &str, bytes: Vec<u8>) -> CoId {
        let id = CoId::from_content(&bytes);
        self.inner.binaries.borrow_mut().insert(
            id.clone(),
            BinaryBlob {
                mime: mime.to_string(),
                bytes,
            },
        );
        id
    }

    /// Number of loads waiting for a pump.
    pub fn pending_load_count(&self) -> usize {
        self.inner.pending_loads.borrow().len()
    }

    /// Simulates a disconnected transport: load requests are held instead
    /// of queued, so waits resolve to timeouts. Going back online releases
    /// the held requests for the next pump.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.set(offline);
        if !offline {
            let held: Vec<CoId> = self.inner.held_loads.borrow_mut().drain(..).collect();
            let mut pending = self.inner.pending_loads.borrow_mut();
            for id in held {
                if !pending.contains(&id) {
                    pending.push_back(id);
                }
            }
        }
    }

    fn mint_id(&self, schema: &Option<CoId>, kind: CoKind, created_at: i64, data: &Value) -> CoId {
        // Header bytes plus a uniqueness nonce: identical creates still get
        // distinct addresses.
        let nonce = Uuid::new_v4().to_string();
        let payload = postcard::to_allocvec(&(
            kind.as_str(),
            schema.as_ref().map(|s| s.as_str().to_string()),
            created_at,
            nonce,
            data.to_string(),
        ))
        .unwrap_or_default();
        CoId::from_content(&payload)
    }

    fn content_from_data(&self, kind: CoKind, data: Value) -> CoContent {
        match kind {
            CoKind::Map => {
                let entries = match data {
                    Value::Object(map) => map
                        .into_iter()
                        .map(|(key, value)| MapEntry { key, value })
                        .collect(),
                    _ => Vec::new(),
                };
                CoContent::Map(entries)
            }
            CoKind::List => {
                let items = match data {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                };
                CoContent::List(items)
            }
            CoKind::Stream => {
                let now = self.now_ms();
                let log = match data {
                    Value::Array(items) => items
                        .into_iter()
                        .enumerate()
                        .map(|(tx, value)| StreamItem {
                            value,
                            made_at: now,
                            tx: tx as u64,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                if log.is_empty() {
                    CoContent::Stream(vec![])
                } else {
                    CoContent::Stream(vec![(self.inner.session.clone(), log)])
                }
            }
        }
    }

    fn announce(&self, event: WriteEvent) {
        let hooks: Vec<WriteHook> = self.inner.write_hooks.borrow().iter().cloned().collect();
        for hook in hooks {
            hook(&event);
        }
    }
}

impl Default for MemoryPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl Peer for MemoryPeer {
    fn entry(&self, id: &CoId) -> CoHandle {
        let mut handles = self.inner.handles.borrow_mut();
        handles
            .entry(id.clone())
            .or_insert_with(|| CoHandle::placeholder(id.clone()))
            .clone()
    }

    fn is_known(&self, id: &CoId) -> bool {
        if self.inner.storage.borrow().contains_key(id) {
            return true;
        }
        self.inner
            .handles
            .borrow()
            .get(id)
            .map(|h| h.is_available())
            .unwrap_or(false)
    }

    fn load(&self, id: &CoId) {
        if self.entry(id).is_available() {
            return;
        }
        if !self.inner.storage.borrow().contains_key(id) {
            return;
        }
        if self.inner.offline.get() {
            let mut held = self.inner.held_loads.borrow_mut();
            if !held.contains(id) {
                held.push(id.clone());
            }
            return;
        }
        let mut pending = self.inner.pending_loads.borrow_mut();
        if !pending.contains(id) {
            pending.push_back(id.clone());
        }
    }

    fn pump(&self) -> bool {
        let pending: Vec<CoId> = self.inner.pending_loads.borrow_mut().drain(..).collect();
        if pending.is_empty() {
            return false;
        }
        for id in pending {
            let stored = self.inner.storage.borrow().get(&id).cloned();
            if let Some(stored) = stored {
                self.entry(&id).install(stored.header, stored.content);
            }
        }
        true
    }

    fn subscribe(&self, id: &CoId, cb: PeerCallback) -> PeerSubscription {
        self.entry(id).subscribe(cb)
    }

    fn create_co_value(&self, req: CreateRequest) -> Result<CoId> {
        if let Some(hook) = self.inner.validation.borrow().clone() {
            if let Err(messages) = hook(&req) {
                return Err(CovalError::ValidationFailure { messages });
            }
        }

        if req.kind == CoKind::Map && !req.data.is_object() {
            return Err(CovalError::Serialization(
                "comap data must be an object".to_string(),
            ));
        }

        let created_at = self.now_ms();
        let id = self.mint_id(&req.schema, req.kind, created_at, &req.data);
        let header = CoHeader {
            kind: req.kind,
            schema: req.schema.clone(),
            type_hint: None,
            ruleset: None,
            spark: req.spark.clone(),
            sealed: vec![],
            created_at,
        };
        let content = self.content_from_data(req.kind, req.data);
        self.entry(&id).install(header, content);

        self.announce(WriteEvent {
            id: id.clone(),
            schema: req.schema,
            kind: req.kind,
            replicated: false,
        });
        Ok(id)
    }

    fn all_co_values(&self) -> Vec<CoId> {
        let mut ids: Vec<CoId> = self.inner.handles.borrow().keys().cloned().collect();
        for id in self.inner.storage.borrow().keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids
    }

    fn account(&self) -> CoId {
        self.inner.account.clone()
    }

    fn session_id(&self) -> String {
        self.inner.session.clone()
    }

    fn load_binary(&self, id: &CoId) -> Option<BinaryBlob> {
        self.inner.binaries.borrow().get(id).cloned()
    }

    fn set_validation_hook(&self, hook: ValidationHook) {
        *self.inner.validation.borrow_mut() = Some(hook);
    }

    fn add_write_hook(&self, hook: WriteHook) {
        self.inner.write_hooks.borrow_mut().push(hook);
    }

    fn now_ms(&self) -> i64 {
        match self.inner.time.borrow().as_ref() {
            Some(provider) => provider.now_ms(),
            None => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }
}
