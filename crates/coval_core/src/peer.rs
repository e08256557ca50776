//! Co-value model and the peer capability consumed by the engine.
//!
//! The peer owns co-value handles, their session transaction logs, and the
//! storage/transport machinery behind them. The engine treats it as an opaque
//! capability: handles are obtained on first reference, loads are requested
//! and driven by [`Peer::pump`], and change notification arrives through
//! subscriptions.

use crate::co_id::CoId;
use crate::error::{CovalError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Kind of a co-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoKind {
    /// Map-shaped co-value (`comap`).
    #[serde(rename = "comap")]
    Map,
    /// List-shaped co-value (`colist`).
    #[serde(rename = "colist")]
    List,
    /// Append-only-stream-shaped co-value (`costream`).
    #[serde(rename = "costream")]
    Stream,
}

impl CoKind {
    /// Returns the wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Map => "comap",
            Self::List => "colist",
            Self::Stream => "costream",
        }
    }

    /// Parses a wire name into a kind.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "comap" => Some(Self::Map),
            "colist" => Some(Self::List),
            "costream" => Some(Self::Stream),
            _ => None,
        }
    }
}

/// Immutable co-value header.
///
/// The header is written once at creation. `schema` may lag behind
/// availability on replicated values; see
/// [`crate::loader::CoValueLoader::await_schema_in_header`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoHeader {
    /// Kind of the co-value.
    pub kind: CoKind,

    /// Schema co-id from the `$schema` header metadata.
    #[serde(default)]
    pub schema: Option<CoId>,

    /// Header type marker (e.g. `"account"`).
    #[serde(default)]
    pub type_hint: Option<String>,

    /// Ruleset marker (e.g. `"group"`).
    #[serde(default)]
    pub ruleset: Option<String>,

    /// The spark this co-value is attributed to, when created under one.
    #[serde(default)]
    pub spark: Option<CoId>,

    /// Keys whose values are sealed and masked at extraction.
    #[serde(default)]
    pub sealed: Vec<String>,

    /// Creation timestamp (Unix milliseconds).
    pub created_at: i64,
}

/// One entry of a map-shaped co-value.
///
/// Entries keep the insertion order of the last writer per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: Value,
}

/// One item of a session transaction log in a stream-shaped co-value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    /// Item payload.
    pub value: Value,
    /// Timestamp the item was made at (Unix milliseconds).
    pub made_at: i64,
    /// Per-session transaction sequence number.
    pub tx: u64,
}

/// Loaded co-value content, by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoContent {
    /// Map entries in last-writer insertion order.
    Map(Vec<MapEntry>),
    /// Ordered list items.
    List(Vec<Value>),
    /// Per-session append-only logs, in session arrival order.
    Stream(Vec<(String, Vec<StreamItem>)>),
}

/// Mutable co-value state behind a handle.
#[derive(Debug, Clone, Default)]
pub struct CoState {
    /// Header, present once loaded.
    pub header: Option<CoHeader>,
    /// Content, present once the locally required sessions are loaded.
    pub content: Option<CoContent>,
}

/// Callback fired by the peer whenever a co-value changes, including the
/// transition to available.
pub type PeerCallback = Rc<dyn Fn(&CoHandle)>;

#[derive(Default)]
struct Subscribers {
    next: u64,
    entries: Vec<(u64, PeerCallback)>,
}

/// RAII subscription guard returned by [`Peer::subscribe`].
///
/// Unsubscribes on drop; explicit [`PeerSubscription::unsubscribe`] is
/// idempotent.
pub struct PeerSubscription {
    token: u64,
    subs: Weak<RefCell<Subscribers>>,
}

impl PeerSubscription {
    /// Removes the subscription. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(subs) = self.subs.upgrade() {
            subs.borrow_mut().entries.retain(|(t, _)| *t != self.token);
        }
    }
}

impl Drop for PeerSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Cheap cloneable handle to one co-value.
///
/// Snapshot accessors clone out of the shared state so callers never hold a
/// borrow across reentrant notification.
#[derive(Clone)]
pub struct CoHandle {
    id: CoId,
    state: Rc<RefCell<CoState>>,
    subs: Rc<RefCell<Subscribers>>,
}

impl CoHandle {
    /// Creates a handle over fresh empty (unavailable) state.
    pub fn placeholder(id: CoId) -> Self {
        Self {
            id,
            state: Rc::new(RefCell::new(CoState::default())),
            subs: Rc::new(RefCell::new(Subscribers::default())),
        }
    }

    /// The co-id this handle refers to.
    pub fn id(&self) -> &CoId {
        &self.id
    }

    /// Availability: header and locally required sessions are loaded.
    pub fn is_available(&self) -> bool {
        let state = self.state.borrow();
        state.header.is_some() && state.content.is_some()
    }

    /// Snapshot of the header, if loaded.
    pub fn header(&self) -> Option<CoHeader> {
        self.state.borrow().header.clone()
    }

    /// Kind from the header, if loaded.
    pub fn kind(&self) -> Option<CoKind> {
        self.state.borrow().header.as_ref().map(|h| h.kind)
    }

    /// Snapshot of map entries in last-writer insertion order.
    ///
    /// Empty when the co-value is not a loaded map.
    pub fn map_entries(&self) -> Vec<MapEntry> {
        match self.state.borrow().content {
            Some(CoContent::Map(ref entries)) => entries.clone(),
            _ => Vec::new(),
        }
    }

    /// Looks up one map key.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.state.borrow().content {
            Some(CoContent::Map(ref entries)) => entries
                .iter()
                .find(|e| e.key == key)
                .map(|e| e.value.clone()),
            _ => None,
        }
    }

    /// Snapshot of list items.
    pub fn list_items(&self) -> Vec<Value> {
        match self.state.borrow().content {
            Some(CoContent::List(ref items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Snapshot of stream sessions and their logs.
    pub fn stream_sessions(&self) -> Vec<(String, Vec<StreamItem>)> {
        match self.state.borrow().content {
            Some(CoContent::Stream(ref sessions)) => sessions.clone(),
            _ => Vec::new(),
        }
    }

    /// Sets a map key, moving it to the end of the entry order.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` on non-map or unavailable co-values.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let kind = state.header.as_ref().map(|h| h.kind);
            match state.content {
                Some(CoContent::Map(ref mut entries)) => {
                    entries.retain(|e| e.key != key);
                    entries.push(MapEntry {
                        key: key.to_string(),
                        value,
                    });
                }
                _ => return Err(unsupported("set", kind)),
            }
        }
        self.notify();
        Ok(())
    }

    /// Deletes a map key. Missing keys are a no-op.
    pub fn delete_key(&self, key: &str) -> Result<()> {
        let changed = {
            let mut state = self.state.borrow_mut();
            let kind = state.header.as_ref().map(|h| h.kind);
            match state.content {
                Some(CoContent::Map(ref mut entries)) => {
                    let before = entries.len();
                    entries.retain(|e| e.key != key);
                    entries.len() != before
                }
                _ => return Err(unsupported("delete", kind)),
            }
        };
        if changed {
            self.notify();
        }
        Ok(())
    }

    /// Appends an item to a list.
    pub fn append(&self, value: Value) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let kind = state.header.as_ref().map(|h| h.kind);
            match state.content {
                Some(CoContent::List(ref mut items)) => items.push(value),
                _ => return Err(unsupported("append", kind)),
            }
        }
        self.notify();
        Ok(())
    }

    /// Removes the first list item equal to `value`. Returns whether an
    /// item was removed.
    pub fn remove_item(&self, value: &Value) -> Result<bool> {
        let removed = {
            let mut state = self.state.borrow_mut();
            let kind = state.header.as_ref().map(|h| h.kind);
            match state.content {
                Some(CoContent::List(ref mut items)) => {
                    match items.iter().position(|i| i == value) {
                        Some(pos) => {
                            items.remove(pos);
                            true
                        }
                        None => false,
                    }
                }
                _ => return Err(unsupported("remove", kind)),
            }
        };
        if removed {
            self.notify();
        }
        Ok(removed)
    }

    /// Appends an item to the given session log of a stream.
    pub fn push(&self, session_id: &str, value: Value, made_at: i64) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let kind = state.header.as_ref().map(|h| h.kind);
            match state.content {
                Some(CoContent::Stream(ref mut sessions)) => {
                    let idx = match sessions.iter().position(|(s, _)| s == session_id) {
                        Some(idx) => idx,
                        None => {
                            sessions.push((session_id.to_string(), Vec::new()));
                            sessions.len() - 1
                        }
                    };
                    let log = &mut sessions[idx].1;
                    let tx = log.len() as u64;
                    log.push(StreamItem { value, made_at, tx });
                }
                _ => return Err(unsupported("push", kind)),
            }
        }
        self.notify();
        Ok(())
    }

    /// Installs loaded state and notifies subscribers. Peer-side operation
    /// used when a load or a replicated update completes.
    pub fn install(&self, header: CoHeader, content: CoContent) {
        {
            let mut state = self.state.borrow_mut();
            state.header = Some(header);
            state.content = Some(content);
        }
        self.notify();
    }

    /// Updates the header's schema metadata after the fact (late header
    /// sync on replicated values) and notifies subscribers.
    pub fn install_header_schema(&self, schema: CoId) {
        let updated = {
            let mut state = self.state.borrow_mut();
            match state.header {
                Some(ref mut header) => {
                    header.schema = Some(schema);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify();
        }
    }

    /// Synthetic change notification. Dependency subscriptions use this to
    /// re-announce a co-value whose referenced data changed, so every store
    /// built on it reprocesses.
    pub fn touch(&self) {
        self.notify();
    }

    /// Registers a change callback. Fired synchronously after every change,
    /// including the transition to available.
    pub fn subscribe(&self, cb: PeerCallback) -> PeerSubscription {
        let token = {
            let mut subs = self.subs.borrow_mut();
            subs.next += 1;
            let token = subs.next;
            subs.entries.push((token, cb));
            token
        };
        PeerSubscription {
            token,
            subs: Rc::downgrade(&self.subs),
        }
    }

    fn notify(&self) {
        // Snapshot before invoking: subscribers may subscribe/unsubscribe
        // reentrantly.
        let callbacks: Vec<PeerCallback> = self
            .subs
            .borrow()
            .entries
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(self);
        }
    }
}

fn unsupported(op: &str, kind: Option<CoKind>) -> CovalError {
    CovalError::UnsupportedOperation {
        op: op.to_string(),
        kind: kind.map(|k| k.as_str().to_string()).unwrap_or_else(|| "unloaded".to_string()),
    }
}

/// Request passed to [`Peer::create_co_value`].
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Resolved schema co-id for the header.
    pub schema: Option<CoId>,
    /// Kind to create.
    pub kind: CoKind,
    /// Initial data: object for maps, array for lists; ignored for streams.
    pub data: Value,
    /// Owning spark, when scoped.
    pub spark: Option<CoId>,
    /// Whether the record is a schema definition.
    pub is_schema_definition: bool,
}

/// Write event observed by storage-level hooks (local and replicated).
#[derive(Debug, Clone)]
pub struct WriteEvent {
    /// The written co-value.
    pub id: CoId,
    /// Its header schema, when known.
    pub schema: Option<CoId>,
    /// Its kind.
    pub kind: CoKind,
    /// Whether this write arrived via replication rather than a local create.
    pub replicated: bool,
}

/// Validation hook run by the peer before any create mutation.
pub type ValidationHook = Rc<dyn Fn(&CreateRequest) -> std::result::Result<(), Vec<String>>>;

/// Write hook observing all writes, including replicated ones.
pub type WriteHook = Rc<dyn Fn(&WriteEvent)>;

/// A binary co-value payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryBlob {
    /// MIME type of the payload.
    pub mime: String,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

/// The CRDT/transport primitive consumed by the engine.
///
/// All waiting in the engine is a deadline loop over [`Peer::pump`]; a peer
/// that has nothing left to advance returns `false` and the wait resolves.
pub trait Peer {
    /// Returns the handle for an id, creating a placeholder on first
    /// reference. `None` when the id is malformed for this peer.
    fn entry(&self, id: &CoId) -> CoHandle;

    /// Whether the peer knows this id (loaded or present in storage).
    fn is_known(&self, id: &CoId) -> bool;

    /// Requests a load from storage. Completion is driven by [`Peer::pump`]
    /// and announced through subscriptions.
    fn load(&self, id: &CoId);

    /// Drives pending background work. Returns `true` if progress was made.
    fn pump(&self) -> bool;

    /// Subscribes to changes of one co-value.
    fn subscribe(&self, id: &CoId, cb: PeerCallback) -> PeerSubscription;

    /// Creates a new co-value. Runs the validation hook before mutating and
    /// announces the write to all write hooks afterwards.
    fn create_co_value(&self, req: CreateRequest) -> Result<CoId>;

    /// All co-ids currently known to the peer.
    fn all_co_values(&self) -> Vec<CoId>;

    /// The account root co-value.
    fn account(&self) -> CoId;

    /// This peer's local session id.
    fn session_id(&self) -> String;

    /// Loads a binary co-value payload, if present.
    fn load_binary(&self, id: &CoId) -> Option<BinaryBlob>;

    /// Installs the validation hook run before create mutations.
    fn set_validation_hook(&self, hook: ValidationHook);

    /// Adds a write hook observing all writes, including replicated ones.
    fn add_write_hook(&self, hook: WriteHook);

    /// Waits for storage sync of pending writes.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Current time in Unix milliseconds, from the peer's clock.
    fn now_ms(&self) -> i64;
}
