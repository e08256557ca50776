//! The engine facade: peer, schemas, cache, scheduler, and hooks in one
//! handle.
//!
//! An [`Engine`] owns the node-local state (subscription cache, scheduler,
//! index manager) and consumes the external capabilities (peer, schema
//! resolver, evaluator). Construction installs the validation gate as the
//! peer's create hook and the index maintenance as a storage-level write
//! hook, so replicated writes are indexed exactly like local ones.

use crate::cache::SubscriptionCache;
use crate::co_id::CoId;
use crate::config::Config;
use crate::evaluator::{Evaluator, LiteralEvaluator};
use crate::index::IndexManager;
use crate::loader::CoValueLoader;
use crate::peer::Peer;
use crate::read::{ListingCtx, ReadOptions};
use crate::scheduler::Scheduler;
use crate::schema::SchemaResolver;
use crate::TimeProvider;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Upper bound for [`Engine::settle`] iterations.
const MAX_SETTLE_STEPS: usize = 1_000;

pub(crate) struct EngineInner {
    pub(crate) peer: Rc<dyn Peer>,
    pub(crate) schemas: Rc<dyn SchemaResolver>,
    pub(crate) evaluator: RefCell<Rc<dyn Evaluator>>,
    pub(crate) loader: CoValueLoader,
    pub(crate) cache: SubscriptionCache,
    pub(crate) scheduler: Scheduler,
    pub(crate) index: IndexManager,
    pub(crate) config: Config,
    pub(crate) os: CoId,
    pub(crate) all_listings: RefCell<Vec<Weak<ListingCtx>>>,
}

/// The CRUD and reactive resolution engine.
///
/// Cheaply cloneable; clones share all state. The engine holds the peer
/// and tears down with it; cached state never outlives the peer.
///
/// # Examples
///
/// ```
/// use coval_core::{CoKind, Engine, MemoryPeer, StaticSchemas};
/// use std::rc::Rc;
///
/// let peer = MemoryPeer::new();
/// let os = peer.deliver(None, CoKind::Map, serde_json::json!({}));
/// let schemas = StaticSchemas::new();
/// let engine = Engine::new(Rc::new(peer), Rc::new(schemas), os);
///
/// let store = engine.read_all(None, &Default::default());
/// assert!(store.get().value().is_some());
/// ```
pub struct Engine {
    pub(crate) inner: Rc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Engine {
    /// Creates an engine with default configuration.
    ///
    /// `os` is the co-id of the OS map carrying `indexes` and `schematas`.
    pub fn new(peer: Rc<dyn Peer>, schemas: Rc<dyn SchemaResolver>, os: CoId) -> Self {
        Self::with_config(peer, schemas, os, Config::default())
    }

    /// Creates an engine with explicit configuration.
    pub fn with_config(
        peer: Rc<dyn Peer>,
        schemas: Rc<dyn SchemaResolver>,
        os: CoId,
        config: Config,
    ) -> Self {
        let scheduler = Scheduler::new();
        let clock_peer = Rc::clone(&peer);
        let time: Rc<dyn TimeProvider> = Rc::new(move || clock_peer.now_ms());
        let cache = SubscriptionCache::new(scheduler.clone(), time, config.cleanup.grace_ms);
        let loader = CoValueLoader::new(Rc::clone(&peer));
        let index = IndexManager::new(Rc::clone(&peer), Rc::clone(&schemas), os.clone());

        let inner = Rc::new(EngineInner {
            peer: Rc::clone(&peer),
            schemas: Rc::clone(&schemas),
            evaluator: RefCell::new(Rc::new(LiteralEvaluator)),
            loader,
            cache,
            scheduler,
            index,
            config,
            os,
            all_listings: RefCell::new(Vec::new()),
        });

        // Validation gate: runs before every create mutation at the peer.
        let gate_schemas = Rc::clone(&schemas);
        peer.set_validation_hook(Rc::new(move |req| match &req.schema {
            Some(schema) => gate_schemas.validate(schema, &req.data),
            None => Ok(()),
        }));

        // Storage-level index maintenance and memo invalidation, observing
        // local and replicated writes alike.
        let weak = Rc::downgrade(&inner);
        peer.add_write_hook(Rc::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let engine = Engine { inner };
            engine.inner.cache.invalidate_resolved_data(&event.id);
            if let Some(schema) = &event.schema {
                engine.inner.index.record_created(&event.id, schema);
            }
            engine.refresh_all_listings();
        }));

        Self { inner }
    }

    /// Replaces the filter-expression evaluator.
    pub fn set_evaluator(&self, evaluator: Rc<dyn Evaluator>) {
        *self.inner.evaluator.borrow_mut() = evaluator;
    }

    /// The peer capability.
    pub fn peer(&self) -> &Rc<dyn Peer> {
        &self.inner.peer
    }

    /// The schema resolver capability.
    pub fn schemas(&self) -> &Rc<dyn SchemaResolver> {
        &self.inner.schemas
    }

    /// The subscription cache.
    pub fn cache(&self) -> &SubscriptionCache {
        &self.inner.cache
    }

    /// The cooperative scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The designated system spark, when configured. Records attributed
    /// to it bypass update validation.
    pub fn system_spark(&self) -> Option<CoId> {
        self.inner
            .config
            .registries
            .system_spark
            .as_deref()
            .and_then(|id| CoId::parse(id).ok())
    }

    /// The OS map co-id.
    pub fn os(&self) -> &CoId {
        &self.inner.os
    }

    /// Current time in Unix milliseconds, from the peer's clock.
    pub fn now_ms(&self) -> i64 {
        self.inner.peer.now_ms()
    }

    /// Drives one step of background work: pump the peer, drain the
    /// microtask queue, run due deferred jobs. Returns whether anything
    /// happened.
    pub fn tick(&self) -> bool {
        let pumped = self.inner.peer.pump();
        let drained = self.inner.scheduler.drain();
        let deferred = self.inner.scheduler.run_due(self.now_ms());
        pumped || drained > 0 || deferred > 0
    }

    /// Ticks until the engine is idle: no pending loads, microtasks, or
    /// due deferred jobs.
    pub fn settle(&self) {
        for _ in 0..MAX_SETTLE_STEPS {
            if !self.tick() {
                return;
            }
        }
        debug!("settle hit its step bound; background work keeps arriving");
    }

    /// Downgrades to a weak handle for use in subscription closures, so
    /// stores never keep the engine alive.
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn default_read_options(&self) -> ReadOptions {
        ReadOptions::from_config(&self.inner.config.read)
    }

    pub(crate) fn evaluator(&self) -> Rc<dyn Evaluator> {
        Rc::clone(&self.inner.evaluator.borrow())
    }
}

/// Weak counterpart of [`Engine`]; upgrade before use.
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    /// Upgrades to a strong engine handle if it is still alive.
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}
