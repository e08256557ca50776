//! Reactive stores: observable cells with subscribe/unsubscribe semantics.
//!
//! A store is the unit of delivery at the engine boundary. `set` replaces the
//! current value and synchronously notifies subscribers in registration
//! order; subscription during notification is allowed and receives future
//! updates only.

use crate::co_id::CoId;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// State of a read store.
///
/// Read paths never throw: errors surface as a state transition. Collection
/// reads start at `Ready([])` and grow progressively.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadState {
    /// The underlying co-value is not yet available.
    Loading,
    /// Projected (and possibly partially resolved) record.
    Ready(Value),
    /// Terminal failure for this read.
    Error {
        /// The co-id the read was about, when known.
        id: Option<CoId>,
        /// Human-readable failure description.
        message: String,
    },
}

impl ReadState {
    /// Whether the store has not produced data yet.
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// The ready value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Renders the state in its wire shape: `{"loading": true}`, the data
    /// itself, or `{"error": …, "id": …}`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Loading => json!({ "loading": true }),
            Self::Ready(value) => value.clone(),
            Self::Error { id, message } => match id {
                Some(id) => json!({ "error": message, "id": id.as_str() }),
                None => json!({ "error": message }),
            },
        }
    }
}

type Subscriber<T> = Rc<dyn Fn(&T)>;

struct StoreInner<T> {
    value: T,
    next: u64,
    subscribers: Vec<(u64, Subscriber<T>)>,
    on_empty: Option<Rc<dyn Fn()>>,
    keepalive: Vec<Box<dyn std::any::Any>>,
}

/// Observable cell holding exactly one current value.
///
/// Cheaply cloneable; clones share the cell.
pub struct Store<T> {
    inner: Rc<RefCell<StoreInner<T>>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Store<T> {
    /// Creates a store with an initial value.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                value: initial,
                next: 0,
                subscribers: Vec::new(),
                on_empty: None,
                keepalive: Vec::new(),
            })),
        }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Runs a closure over the current value without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow().value)
    }

    /// Atomically replaces the value, then synchronously notifies all
    /// subscribers in registration order.
    pub fn set(&self, value: T) {
        let (snapshot, current) = {
            let mut inner = self.inner.borrow_mut();
            inner.value = value;
            let snapshot: Vec<Subscriber<T>> = inner
                .subscribers
                .iter()
                .map(|(_, cb)| Rc::clone(cb))
                .collect();
            (snapshot, inner.value.clone())
        };
        for cb in snapshot {
            cb(&current);
        }
    }

    /// Registers a subscriber. A subscriber registered during notification
    /// receives future updates only.
    pub fn subscribe(&self, cb: impl Fn(&T) + 'static) -> StoreSubscription<T> {
        let token = {
            let mut inner = self.inner.borrow_mut();
            inner.next += 1;
            let token = inner.next;
            inner.subscribers.push((token, Rc::new(cb)));
            token
        };
        StoreSubscription {
            token,
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Installs the hook fired when the last subscriber drops. The cache
    /// uses this to schedule a grace-period cleanup.
    pub fn set_on_empty(&self, hook: Rc<dyn Fn()>) {
        self.inner.borrow_mut().on_empty = Some(hook);
    }

    /// Ties a guard's lifetime to the store. Used for the upstream
    /// subscriptions feeding this store, so the pipeline tears down
    /// when the store itself is dropped. The guard's closures must hold
    /// the store weakly (see [`Store::downgrade`]) or the store leaks.
    pub fn retain<G: 'static>(&self, guard: G) {
        self.inner.borrow_mut().keepalive.push(Box::new(guard));
    }

    /// Downgrades to a weak handle for use inside feeding closures.
    pub fn downgrade(&self) -> WeakStore<T> {
        WeakStore {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Weak counterpart of [`Store`]; upgrade before use.
pub struct WeakStore<T> {
    inner: Weak<RefCell<StoreInner<T>>>,
}

impl<T> Clone for WeakStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> WeakStore<T> {
    /// Upgrades to a strong store handle if it is still alive.
    pub fn upgrade(&self) -> Option<Store<T>> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

/// Subscription guard returned by [`Store::subscribe`].
///
/// Unsubscribes on drop; explicit [`StoreSubscription::unsubscribe`] is
/// idempotent.
pub struct StoreSubscription<T> {
    token: u64,
    inner: Weak<RefCell<StoreInner<T>>>,
}

impl<T> StoreSubscription<T> {
    /// Removes the subscription. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let on_empty = {
            let mut inner = inner.borrow_mut();
            let before = inner.subscribers.len();
            inner.subscribers.retain(|(t, _)| *t != self.token);
            if before > 0 && inner.subscribers.is_empty() {
                inner.on_empty.clone()
            } else {
                None
            }
        };
        if let Some(hook) = on_empty {
            hook();
        }
    }
}

impl<T> Drop for StoreSubscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
