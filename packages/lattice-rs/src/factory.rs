//! Store factory: one place that wires entity types to stores.
//!
//! The factory owns the backend handle, the instance namespace, and the cache
//! mode, and hands out one [`DataStore<T>`] per entity type. Repeated calls
//! for the same type return the same store, so every consumer shares one
//! cache namespace per `(instance, entity_type)` pair.
//!
//! Edge walking crosses entity types through the factory's erased registry:
//! a store for every type reachable through edges must have been requested at
//! least once before a walk touches it, or the walk fails with
//! [`LatticeError::StoreUnregistered`](crate::LatticeError). Registering all
//! stores at startup is the expected pattern.
//!
//! # Example
//!
//! ```ignore
//! let factory = StoreFactory::new("prod", backend);
//!
//! // Register every type edges can reach.
//! let users = factory.store::<User>();
//! let posts = factory.store::<Post>();
//! let comments = factory.store::<Comment>();
//!
//! // Typically provided through a scope:
//! scope.provide_value(&STORE_FACTORY, Arc::clone(&factory));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::cache::{EntityCache, MemoryCache, PassthroughCache};
use crate::edges::DocumentStore;
use crate::entity::{Entity, EntityType};
use crate::error::{LatticeError, Result};
use crate::store::DataStore;

/// Which cache implementation the factory builds for each store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// In-memory caching with change listeners.
    #[default]
    Memory,
    /// No caching: every read reaches the backend, listeners never fire.
    Passthrough,
}

/// Creates and registers one [`DataStore`] per entity type.
pub struct StoreFactory {
    instance: String,
    // Self-handle so stores can reach back for edge walks without keeping
    // the factory alive from inside itself.
    me: Weak<StoreFactory>,
    backend: Arc<dyn Backend>,
    cache_mode: CacheMode,
    typed: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    erased: DashMap<EntityType, Arc<dyn DocumentStore>>,
}

impl StoreFactory {
    /// Create a factory with in-memory caching.
    ///
    /// `instance` namespaces every cache this factory builds, so separate
    /// logical environments (`"prod"`, `"preview:42"`) never share entries.
    pub fn new(instance: impl Into<String>, backend: Arc<dyn Backend>) -> Arc<Self> {
        Self::with_cache_mode(instance, backend, CacheMode::default())
    }

    /// Create a factory with an explicit cache mode.
    pub fn with_cache_mode(
        instance: impl Into<String>,
        backend: Arc<dyn Backend>,
        cache_mode: CacheMode,
    ) -> Arc<Self> {
        let instance = instance.into();
        Arc::new_cyclic(|me| Self {
            instance,
            me: me.clone(),
            backend,
            cache_mode,
            typed: DashMap::new(),
            erased: DashMap::new(),
        })
    }

    /// The instance namespace prefix.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Get or create the store for an entity type. The first call registers
    /// the type for edge walking.
    pub fn store<T: Entity>(&self) -> Arc<DataStore<T>> {
        let entry = self
            .typed
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                let store = Arc::new(self.build_store::<T>());
                self.erased
                    .insert(T::entity_type(), Arc::clone(&store) as Arc<dyn DocumentStore>);
                debug!(
                    instance = %self.instance,
                    entity_type = %T::entity_type(),
                    cache_mode = ?self.cache_mode,
                    "registered data store"
                );
                store as Arc<dyn Any + Send + Sync>
            })
            .clone();

        match entry.downcast::<DataStore<T>>() {
            Ok(store) => store,
            Err(_) => {
                // Two Rust types sharing a TypeId cannot happen; recover with
                // a fresh store rather than poisoning every caller.
                error!(
                    entity_type = %T::entity_type(),
                    "typed store registry held a mismatched entry; rebuilding"
                );
                let store = Arc::new(self.build_store::<T>());
                self.erased
                    .insert(T::entity_type(), Arc::clone(&store) as Arc<dyn DocumentStore>);
                self.typed.insert(
                    TypeId::of::<T>(),
                    Arc::clone(&store) as Arc<dyn Any + Send + Sync>,
                );
                store
            }
        }
    }

    /// Whether a store for this entity type has been registered.
    pub fn is_registered(&self, entity_type: EntityType) -> bool {
        self.erased.contains_key(&entity_type)
    }

    pub(crate) fn erased(&self, entity_type: EntityType) -> Result<Arc<dyn DocumentStore>> {
        self.erased
            .get(&entity_type)
            .map(|entry| Arc::clone(&entry))
            .ok_or(LatticeError::StoreUnregistered { entity_type })
    }

    fn build_store<T: Entity>(&self) -> DataStore<T> {
        let namespace = format!("{}/{}", self.instance, T::entity_type());
        let cache: Arc<dyn EntityCache> = match self.cache_mode {
            CacheMode::Memory => Arc::new(MemoryCache::new(namespace)),
            CacheMode::Passthrough => Arc::new(PassthroughCache::new(namespace)),
        };
        DataStore::new(Arc::clone(&self.backend), cache, self.me.clone())
    }
}

impl fmt::Debug for StoreFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreFactory")
            .field("instance", &self.instance)
            .field("cache_mode", &self.cache_mode)
            .field("registered", &self.erased.len())
            .finish()
    }
}
