//! Typed data stores: the cache-through persistence facade.
//!
//! A [`DataStore<T>`] pairs one entity type with a backend and a cache
//! namespace. Reads go through the cache with the backend as fallback; writes
//! go to the backend and settle into the cache, optionally announcing
//! themselves optimistically first. Edge loading is requested per call via
//! [`GetOptions::edges`].
//!
//! Stores are created by a [`StoreFactory`](crate::StoreFactory), never
//! directly, so that edge walks can reach sibling stores.
//!
//! # Optimistic writes
//!
//! With [`WriteOptions::optimistic`], the cache is updated (and listeners
//! notified) before the backend call. If the backend then fails, the error
//! propagates but the cache is NOT rolled back - the optimistic value stays
//! until something overwrites or invalidates it. Callers who cannot tolerate
//! a stale optimistic value should invalidate on error.
//!
//! # Example
//!
//! ```ignore
//! let factory = StoreFactory::new("prod", backend);
//! let posts = factory.store::<Post>();
//!
//! let post = posts
//!     .required("post:1", GetOptions::default().edges(vec![EdgeSelector::all(COMMENT)]))
//!     .await?;
//! ```

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::backend::Backend;
use crate::cache::{CacheOp, ChangeListener, EntityCache};
use crate::edges::{self, DocumentStore, EdgeSelector, SelectorSet};
use crate::entity::{
    document_id, from_document, strip_inverse_fields, to_document, Document, Entity,
    EntitySchema, FIELD_CREATED_AT, FIELD_ID, FIELD_UPDATED_AT,
};
use crate::error::{LatticeError, Result};
use crate::query::Query;
use crate::scope::Subscription;

// =============================================================================
// Options
// =============================================================================

/// How a read treats the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Serve from cache when possible.
    #[default]
    Cached,
    /// Invalidate first, forcing a backend read that repopulates the cache.
    Refresh,
}

/// Options for `get` / `required` / `query`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Cache treatment for this read.
    pub policy: CachePolicy,
    /// Edges to load on the result. Empty means ids stay ids.
    pub edges: Vec<EdgeSelector>,
}

impl GetOptions {
    /// Set the cache policy.
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the edge selectors.
    pub fn edges(mut self, edges: Vec<EdgeSelector>) -> Self {
        self.edges = edges;
        self
    }
}

/// Options for `create` / `update` / `remove`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Announce the write to the cache before the backend confirms it.
    pub optimistic: bool,
}

impl WriteOptions {
    /// The optimistic variant.
    pub fn optimistic() -> Self {
        Self { optimistic: true }
    }
}

// =============================================================================
// Data Store
// =============================================================================

/// Cache-through persistence facade for one entity type.
pub struct DataStore<T: Entity> {
    backend: Arc<dyn Backend>,
    cache: Arc<dyn EntityCache>,
    factory: Weak<crate::StoreFactory>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> DataStore<T> {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        cache: Arc<dyn EntityCache>,
        factory: Weak<crate::StoreFactory>,
    ) -> Self {
        Self {
            backend,
            cache,
            factory,
            _entity: PhantomData,
        }
    }

    /// The cache namespace this store reads and writes.
    pub fn namespace(&self) -> &str {
        self.cache.namespace()
    }

    /// Fetch one entity by id, or `None` if it does not exist anywhere.
    pub async fn get(&self, id: &str, options: GetOptions) -> Result<Option<T>> {
        if options.policy == CachePolicy::Refresh {
            self.cache.invalidate(id);
        }

        let entity_type = T::entity_type();
        let backend = Arc::clone(&self.backend);
        let owned = id.to_string();
        let doc = self
            .cache
            .get(
                id,
                Box::pin(async move { backend.get(entity_type, &owned).await }),
            )
            .await?;

        let Some(mut doc) = doc else {
            return Ok(None);
        };

        if !options.edges.is_empty() {
            let selectors = SelectorSet::root(&options.edges);
            self.walk(std::slice::from_mut(&mut doc), &selectors).await?;
        }
        from_document(doc).map(Some)
    }

    /// Fetch one entity by id, failing with [`LatticeError::NotFound`] if it
    /// does not exist.
    pub async fn required(&self, id: &str, options: GetOptions) -> Result<T> {
        self.get(id, options).await?.ok_or_else(|| LatticeError::NotFound {
            entity_type: T::entity_type(),
            id: id.to_string(),
        })
    }

    /// Persist a new entity. Mints an id if the entity has none, stamps
    /// `created_at` / `updated_at` if absent, and settles the stored form
    /// into the cache.
    pub async fn create(&self, entity: &T, options: WriteOptions) -> Result<T> {
        let entity_type = T::entity_type();
        let mut doc = to_document(entity)?;
        strip_inverse_fields(T::schema(), &mut doc);

        let id = match document_id(&doc).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let minted = format!("{}:{}", entity_type, Uuid::new_v4());
                doc.insert(FIELD_ID.to_string(), Value::String(minted.clone()));
                minted
            }
        };
        let now = Utc::now().to_rfc3339();
        for field in [FIELD_CREATED_AT, FIELD_UPDATED_AT] {
            if doc.get(field).map_or(true, Value::is_null) {
                doc.insert(field.to_string(), Value::String(now.clone()));
            }
        }

        if options.optimistic {
            debug!(entity_type = %entity_type, id = %id, "optimistic create");
            self.cache.put(&id, CacheOp::Add, doc.clone());
        }

        let stored = self.backend.create(entity_type, doc).await?;
        let op = if options.optimistic {
            CacheOp::Update
        } else {
            CacheOp::Add
        };
        self.cache.put(&id, op, stored.clone());
        from_document(stored)
    }

    /// Persist changes to an existing entity. The entity must carry an id.
    pub async fn update(&self, entity: &T, options: WriteOptions) -> Result<T> {
        let entity_type = T::entity_type();
        let mut doc = to_document(entity)?;
        strip_inverse_fields(T::schema(), &mut doc);

        let id = document_id(&doc)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or(LatticeError::MissingId { entity_type })?;
        doc.insert(
            FIELD_UPDATED_AT.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        if options.optimistic {
            // Republish only when an entry exists, merging the changed
            // fields over it so listeners see a full document. A cold cache
            // stays cold until the backend confirms.
            let current = self
                .cache
                .get(
                    &id,
                    Box::pin(std::future::ready(Ok::<Option<Document>, LatticeError>(None))),
                )
                .await?;
            if let Some(mut merged) = current {
                debug!(entity_type = %entity_type, id = %id, "optimistic update");
                for (key, value) in &doc {
                    merged.insert(key.clone(), value.clone());
                }
                self.cache.put(&id, CacheOp::Update, merged);
            }
        }

        let stored = self.backend.update(entity_type, doc).await?;
        self.cache.put(&id, CacheOp::Update, stored.clone());
        from_document(stored)
    }

    /// Delete by id. With optimistic writes the cache entry is evicted (and
    /// listeners notified) before the backend confirms.
    pub async fn remove(&self, id: &str, options: WriteOptions) -> Result<()> {
        let entity_type = T::entity_type();
        if options.optimistic {
            debug!(entity_type = %entity_type, id, "optimistic remove");
            self.cache.remove(id);
        }
        self.backend.remove(entity_type, id).await?;
        if !options.optimistic {
            self.cache.remove(id);
        }
        Ok(())
    }

    /// Run a query. Repeats of a previously loaded filter combination are
    /// served by scanning the cache; see [`Query::fingerprint`].
    pub async fn query(&self, query: Query, options: GetOptions) -> Result<Vec<T>> {
        if options.policy == CachePolicy::Refresh {
            self.cache.invalidate_query(&query);
        }

        let entity_type = T::entity_type();
        let backend = Arc::clone(&self.backend);
        let for_backend = query.clone();
        let mut docs = self
            .cache
            .query(
                &query,
                Box::pin(async move { backend.query(entity_type, &for_backend).await }),
            )
            .await?;

        if !options.edges.is_empty() {
            let selectors = SelectorSet::root(&options.edges);
            self.walk(&mut docs, &selectors).await?;
        }
        docs.into_iter().map(from_document).collect()
    }

    /// Subscribe to change events for specific ids, or every id with
    /// [`WILDCARD_ID`](crate::WILDCARD_ID).
    pub fn listen(&self, ids: &[&str], listener: ChangeListener) -> Subscription {
        self.cache.listen(ids, listener)
    }

    async fn walk(&self, docs: &mut [Document], selectors: &SelectorSet) -> Result<()> {
        let factory = self
            .factory
            .upgrade()
            .ok_or(LatticeError::StoreUnregistered {
                entity_type: T::entity_type(),
            })?;
        edges::walk(&factory, T::schema(), docs, selectors).await
    }
}

#[async_trait::async_trait]
impl<T: Entity> DocumentStore for DataStore<T> {
    fn schema(&self) -> &'static EntitySchema {
        T::schema()
    }

    async fn load_with_edges(
        &self,
        id: &str,
        selectors: SelectorSet,
    ) -> Result<Option<Document>> {
        let entity_type = T::entity_type();
        let backend = Arc::clone(&self.backend);
        let owned = id.to_string();
        let doc = self
            .cache
            .get(
                id,
                Box::pin(async move { backend.get(entity_type, &owned).await }),
            )
            .await?;

        let Some(mut doc) = doc else {
            return Ok(None);
        };
        self.walk(std::slice::from_mut(&mut doc), &selectors).await?;
        Ok(Some(doc))
    }

    async fn query_with_edges(
        &self,
        query: Query,
        selectors: SelectorSet,
    ) -> Result<Vec<Document>> {
        let entity_type = T::entity_type();
        let backend = Arc::clone(&self.backend);
        let for_backend = query.clone();
        let mut docs = self
            .cache
            .query(
                &query,
                Box::pin(async move { backend.query(entity_type, &for_backend).await }),
            )
            .await?;
        self.walk(&mut docs, &selectors).await?;
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBackend, User};
    use crate::StoreFactory;

    #[tokio::test]
    async fn test_create_mints_id_and_timestamps() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        let created = users
            .create(&User::fixture("", "Ann"), WriteOptions::default())
            .await
            .unwrap();
        assert!(created.id.starts_with("user:"));
        assert!(created.created_at.is_some());
        assert!(created.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_create_preserves_caller_id() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        let created = users
            .create(&User::fixture("user:7", "Ann"), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(created.id, "user:7");
    }

    #[tokio::test]
    async fn test_get_after_create_is_served_from_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        let created = users
            .create(&User::fixture("user:1", "Ann"), WriteOptions::default())
            .await
            .unwrap();
        let fetched = users
            .get(&created.id, GetOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.name, "Ann");
        assert_eq!(backend.reads(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_survives_cache_eviction() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        let mut ann = User::fixture("user:1", "Ann");
        ann.email = Some("ann@example.com".to_string());
        let created = users.create(&ann, WriteOptions::default()).await.unwrap();

        // A refresh read bypasses the cache entirely; everything written must
        // come back from the backend intact.
        let reloaded = users
            .required(
                "user:1",
                GetOptions::default().policy(CachePolicy::Refresh),
            )
            .await
            .unwrap();
        assert_eq!(reloaded, created);
        assert_eq!(reloaded.email.as_deref(), Some("ann@example.com"));
        assert!(reloaded.created_at.is_some());
        assert!(reloaded.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_policy_forces_backend_read() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        users
            .create(&User::fixture("user:1", "Ann"), WriteOptions::default())
            .await
            .unwrap();
        users
            .get(
                "user:1",
                GetOptions::default().policy(CachePolicy::Refresh),
            )
            .await
            .unwrap();
        assert_eq!(backend.reads(), 1);
    }

    #[tokio::test]
    async fn test_required_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        let err = users
            .required("user:missing", GetOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_requires_id() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        let err = users
            .update(&User::fixture("", "Ann"), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LatticeError::MissingId { .. }));
    }

    #[tokio::test]
    async fn test_optimistic_update_on_cold_cache_stays_cold() {
        use crate::cache::CacheOp;
        use crate::testing::USER;
        use crate::WILDCARD_ID;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        // Seed the backend directly; the cache has never seen this entity.
        backend.insert_raw(
            USER,
            to_document(&User::fixture("user:1", "Ann")).unwrap(),
        );

        let updates = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&updates);
        let _sub = users.listen(
            &[WILDCARD_ID],
            Arc::new(move |event| {
                if event.op == CacheOp::Update {
                    sink.fetch_add(1, Ordering::Relaxed);
                }
            }),
        );

        backend.fail_next("write rejected");
        let renamed = User::fixture("user:1", "Anne");
        assert!(users
            .update(&renamed, WriteOptions::optimistic())
            .await
            .is_err());

        // No cache entry existed, so nothing was published optimistically;
        // the next read serves the backend's unchanged value.
        assert_eq!(updates.load(Ordering::Relaxed), 0);
        let current = users
            .required("user:1", GetOptions::default())
            .await
            .unwrap();
        assert_eq!(current.name, "Ann");
    }

    #[tokio::test]
    async fn test_remove_evicts_cache_and_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        users
            .create(&User::fixture("user:1", "Ann"), WriteOptions::default())
            .await
            .unwrap();
        users.remove("user:1", WriteOptions::default()).await.unwrap();

        let gone = users.get("user:1", GetOptions::default()).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_query_refresh_policy_reaches_the_backend() {
        use crate::query::FilterOp;

        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        users
            .create(&User::fixture("user:1", "Ann"), WriteOptions::default())
            .await
            .unwrap();

        let q = || Query::new().filter("name", FilterOp::Eq, "Ann");
        users.query(q(), GetOptions::default()).await.unwrap();
        users.query(q(), GetOptions::default()).await.unwrap();
        assert_eq!(backend.queries(), 1);

        // Refresh bypasses the fingerprint scan and re-runs the backend
        // query, which re-marks the fingerprint for later repeats.
        users
            .query(q(), GetOptions::default().policy(CachePolicy::Refresh))
            .await
            .unwrap();
        assert_eq!(backend.queries(), 2);

        users.query(q(), GetOptions::default()).await.unwrap();
        assert_eq!(backend.queries(), 2);
    }

    #[tokio::test]
    async fn test_query_returns_typed_entities() {
        use crate::query::FilterOp;

        let backend = Arc::new(MemoryBackend::new());
        let factory = StoreFactory::new("test", Arc::clone(&backend) as Arc<dyn Backend>);
        let users = factory.store::<User>();

        users
            .create(&User::fixture("user:1", "Ann"), WriteOptions::default())
            .await
            .unwrap();
        users
            .create(&User::fixture("user:2", "Bea"), WriteOptions::default())
            .await
            .unwrap();

        let matches = users
            .query(
                Query::new().filter("name", FilterOp::Eq, "Bea"),
                GetOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "user:2");
    }
}
