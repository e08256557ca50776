//! Interning cache for stores, subscriptions, resolutions, and memoized
//! projected data.
//!
//! Entries are keyed by logical identity strings and use deferred cleanup:
//! when a store's last subscriber drops, removal is scheduled after a grace
//! period so quick unsubscribe/resubscribe patterns do not churn. The cache
//! is node-local and owned by one engine; it never outlives the peer.

use crate::co_id::CoId;
use crate::peer::PeerSubscription;
use crate::scheduler::Scheduler;
use crate::store::{ReadState, Store};
use crate::TimeProvider;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use tracing::trace;

/// Key constructors for the cache's logical identities.
pub mod keys {
    use crate::co_id::CoId;

    /// Subscription on one co-value.
    pub fn subscription(id: &CoId) -> String {
        format!("subscription:{}", id.as_str())
    }

    /// Dependency subscription on a referenced co-value, per parent.
    pub fn ref_subscription(id: &CoId, parent: &CoId) -> String {
        format!("subscription:ref:{}:{}", id.as_str(), parent.as_str())
    }

    /// Interned collection store.
    pub fn store(schema: &CoId, filter_key: &str, opts_key: &str) -> String {
        format!("store:{}:{}:{}", schema.as_str(), filter_key, opts_key)
    }

    /// In-flight deep resolution per root co-value.
    pub fn resolution(id: &CoId) -> String {
        format!("resolution:{}", id.as_str())
    }

    /// Memoized projected data per co-value and options.
    pub fn resolved(id: &CoId, opts_key: &str) -> String {
        format!("resolved:{}:{}", id.as_str(), opts_key)
    }
}

/// State of a tracked resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// No resolution has been started for the key.
    Fresh,
    /// A resolution is underway; do not start another.
    InFlight,
    /// Resolution completed.
    Done,
}

struct Memo {
    value: Value,
    /// Every co-id embedded in the memoized record; the memo is dropped
    /// when any of them is invalidated.
    involves: HashSet<CoId>,
}

enum CacheEntry {
    Store(Store<ReadState>),
    Subscription(#[allow(dead_code)] PeerSubscription),
    Resolution(ResolutionState),
    Memo(Memo),
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    resolved_flags: HashSet<CoId>,
}

struct CacheShared {
    inner: RefCell<CacheInner>,
    scheduler: Scheduler,
    time: Rc<dyn TimeProvider>,
    grace_ms: i64,
}

/// Process-wide interning cache. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct SubscriptionCache {
    shared: Rc<CacheShared>,
}

impl SubscriptionCache {
    /// Creates a cache wired to a scheduler and clock. `grace_ms` is the
    /// cleanup grace period and must be positive.
    pub fn new(scheduler: Scheduler, time: Rc<dyn TimeProvider>, grace_ms: i64) -> Self {
        Self {
            shared: Rc::new(CacheShared {
                inner: RefCell::new(CacheInner::default()),
                scheduler,
                time,
                grace_ms: grace_ms.clamp(1, 60_000),
            }),
        }
    }

    /// Returns the interned store for a key, creating it with `initial`
    /// when absent. The cache schedules cleanup once the store loses its
    /// last subscriber.
    pub fn get_or_create_store(&self, key: &str, initial: ReadState) -> Store<ReadState> {
        if let Some(store) = self.store(key) {
            return store;
        }
        let store = Store::new(initial);

        let weak: Weak<CacheShared> = Rc::downgrade(&self.shared);
        let cleanup_key = key.to_string();
        store.set_on_empty(Rc::new(move || {
            if let Some(shared) = weak.upgrade() {
                SubscriptionCache { shared }.schedule_cleanup(&cleanup_key);
            }
        }));

        self.shared
            .inner
            .borrow_mut()
            .entries
            .insert(key.to_string(), CacheEntry::Store(store.clone()));
        store
    }

    /// Returns the interned store for a key, if present.
    pub fn store(&self, key: &str) -> Option<Store<ReadState>> {
        match self.shared.inner.borrow().entries.get(key) {
            Some(CacheEntry::Store(store)) => Some(store.clone()),
            _ => None,
        }
    }

    /// Holds a peer subscription under a key, creating it only when absent.
    /// Enforces at most one active subscription per logical identity.
    pub fn hold_subscription(&self, key: &str, factory: impl FnOnce() -> PeerSubscription) {
        if self.shared.inner.borrow().entries.contains_key(key) {
            return;
        }
        let sub = factory();
        self.shared
            .inner
            .borrow_mut()
            .entries
            .insert(key.to_string(), CacheEntry::Subscription(sub));
    }

    /// Whether any entry exists under the key.
    pub fn contains(&self, key: &str) -> bool {
        self.shared.inner.borrow().entries.contains_key(key)
    }

    /// Removes one entry. Dropping a subscription entry unsubscribes it.
    pub fn remove(&self, key: &str) {
        self.shared.inner.borrow_mut().entries.remove(key);
    }

    /// Removes all entries whose key starts with the prefix.
    pub fn remove_prefix(&self, prefix: &str) {
        self.shared
            .inner
            .borrow_mut()
            .entries
            .retain(|key, _| !key.starts_with(prefix));
    }

    /// Current resolution state for a key.
    pub fn resolution_state(&self, key: &str) -> ResolutionState {
        match self.shared.inner.borrow().entries.get(key) {
            Some(CacheEntry::Resolution(state)) => *state,
            _ => ResolutionState::Fresh,
        }
    }

    /// Marks a resolution in flight. Returns `true` if the caller should
    /// run it (it was fresh), `false` if it is already running or done.
    pub fn begin_resolution(&self, key: &str) -> bool {
        let mut inner = self.shared.inner.borrow_mut();
        match inner.entries.get(key) {
            Some(CacheEntry::Resolution(_)) => false,
            _ => {
                inner.entries.insert(
                    key.to_string(),
                    CacheEntry::Resolution(ResolutionState::InFlight),
                );
                true
            }
        }
    }

    /// Marks a resolution completed.
    pub fn complete_resolution(&self, key: &str) {
        self.shared.inner.borrow_mut().entries.insert(
            key.to_string(),
            CacheEntry::Resolution(ResolutionState::Done),
        );
    }

    /// Sets the persistent resolved flag for a co-value.
    pub fn mark_resolved(&self, id: &CoId) {
        self.shared
            .inner
            .borrow_mut()
            .resolved_flags
            .insert(id.clone());
    }

    /// Whether the persistent resolved flag is set.
    pub fn is_resolved(&self, id: &CoId) -> bool {
        self.shared.inner.borrow().resolved_flags.contains(id)
    }

    /// Memoized projected data for `(coId, options)`, if present.
    pub fn get_resolved_data(&self, id: &CoId, opts_key: &str) -> Option<Value> {
        match self
            .shared
            .inner
            .borrow()
            .entries
            .get(&keys::resolved(id, opts_key))
        {
            Some(CacheEntry::Memo(memo)) => Some(memo.value.clone()),
            _ => None,
        }
    }

    /// Memoizes projected data. `involves` lists every co-id embedded in
    /// the record, so mutation of any of them invalidates the memo.
    pub fn set_resolved_data(
        &self,
        id: &CoId,
        opts_key: &str,
        value: Value,
        involves: HashSet<CoId>,
    ) {
        let mut involves = involves;
        involves.insert(id.clone());
        self.shared.inner.borrow_mut().entries.insert(
            keys::resolved(id, opts_key),
            CacheEntry::Memo(Memo { value, involves }),
        );
    }

    /// Returns the memoized record for `(coId, options)` or computes and
    /// memoizes it. Concurrent callers within one drain share the first
    /// computation.
    pub fn get_or_create_resolved_data(
        &self,
        id: &CoId,
        opts_key: &str,
        factory: impl FnOnce() -> (Value, HashSet<CoId>),
    ) -> Value {
        if let Some(value) = self.get_resolved_data(id, opts_key) {
            return value;
        }
        let (value, involves) = factory();
        self.set_resolved_data(id, opts_key, value.clone(), involves);
        value
    }

    /// Drops memoized entries involving a co-value, clears its resolved
    /// flag, and forgets its resolution state. Used when a referenced
    /// co-value mutates.
    pub fn invalidate_resolved_data(&self, id: &CoId) {
        let mut inner = self.shared.inner.borrow_mut();
        inner.entries.retain(|_, entry| match entry {
            CacheEntry::Memo(memo) => !memo.involves.contains(id),
            _ => true,
        });
        inner.entries.remove(&keys::resolution(id));
        inner.resolved_flags.remove(id);
    }

    /// Schedules removal of an entry after the grace period. A store entry
    /// survives if it regained subscribers in the meantime.
    pub fn schedule_cleanup(&self, key: &str) {
        let due = self.shared.time.now_ms() + self.shared.grace_ms;
        let weak = Rc::downgrade(&self.shared);
        let key = key.to_string();
        self.shared.scheduler.defer(due, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut inner = shared.inner.borrow_mut();
            let keep = match inner.entries.get(&key) {
                Some(CacheEntry::Store(store)) => store.subscriber_count() > 0,
                Some(_) => false,
                None => return,
            };
            if !keep {
                trace!(key = %key, "cache cleanup");
                inner.entries.remove(&key);
            }
        });
    }

    /// Number of entries, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.shared.inner.borrow().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
