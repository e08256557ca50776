use super::clock::MockClock;
use coval_core::{
    CoId, CoKind, Config, Engine, MemoryPeer, Peer, ReadState, SchemaDoc, StaticSchemas, Store,
};
use serde_json::{json, Value};
use std::rc::Rc;

/// A complete engine fixture: mock clock, in-memory peer, schema registry.
pub struct World {
    pub clock: MockClock,
    pub peer: MemoryPeer,
    pub schemas: StaticSchemas,
    pub engine: Engine,
    pub os: CoId,
}

impl World {
    /// Builds a fresh engine over an in-memory peer on a mock clock.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Builds a world whose engine recognizes a designated system spark.
    pub fn with_system_spark(system_spark: &CoId) -> Self {
        let mut config = Config::default();
        config.registries.system_spark = Some(system_spark.as_str().to_string());
        Self::with_config(config)
    }

    /// Builds a fresh engine with explicit configuration.
    pub fn with_config(config: Config) -> Self {
        let clock = MockClock::new();
        let peer = MemoryPeer::new().with_time_provider(Rc::new(clock.as_provider()));
        let schemas = StaticSchemas::new();
        let os = peer.deliver(None, CoKind::Map, json!({}));
        let engine = Engine::with_config(
            Rc::new(peer.clone()),
            Rc::new(schemas.clone()),
            os.clone(),
            config,
        );
        Self {
            clock,
            peer,
            schemas,
            engine,
            os,
        }
    }

    /// Registers a comap schema with typed properties.
    pub fn register_map_schema(&self, key: &str, properties: Value, indexing: bool) -> CoId {
        let mut doc = SchemaDoc::named(key);
        doc.cotype = Some(CoKind::Map);
        doc.indexing = indexing;
        doc.properties = properties.as_object().cloned();
        self.schemas.register(key, doc)
    }

    /// Registers a costream schema whose items reference another schema.
    pub fn register_stream_schema(&self, key: &str, item_schema: &str) -> CoId {
        let mut doc = SchemaDoc::named(key);
        doc.cotype = Some(CoKind::Stream);
        doc.items = Some(json!({ "$co": item_schema }));
        self.schemas.register(key, doc)
    }

    /// Creates an empty inbox stream carrying the given schema.
    pub fn make_inbox(&self, schema: &CoId) -> CoId {
        self.peer
            .deliver(Some(schema.clone()), CoKind::Stream, json!([]))
    }

    /// Creates a record through the engine and returns its co-id.
    pub fn create(&self, schema: &str, data: Value) -> anyhow::Result<String> {
        let record = self.engine.create(schema, data, None)?;
        record
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("created record has no id"))
    }

    /// The index list co-id registered for a schema, if any.
    pub fn index_list(&self, schema: &CoId) -> Option<CoId> {
        let os = self.peer.entry(&self.os);
        let indexes = CoId::from_value(&os.get("indexes")?)?;
        CoId::from_value(&self.peer.entry(&indexes).get(schema.as_str())?)
    }

    /// Unwraps a ready store value, settling background work first.
    pub fn ready(&self, store: &Store<ReadState>) -> Value {
        self.engine.settle();
        match store.get() {
            ReadState::Ready(value) => value,
            other => panic!("store not ready: {:?}", other.to_value()),
        }
    }

    /// Unwraps a ready collection store into its items.
    pub fn items(&self, store: &Store<ReadState>) -> Vec<Value> {
        self.ready(store)
            .as_array()
            .cloned()
            .unwrap_or_else(|| panic!("store value is not an array"))
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
