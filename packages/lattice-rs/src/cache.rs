//! Per-entity-type caches with change listeners and query memoization.
//!
//! Two implementations satisfy one interface, [`EntityCache`]:
//!
//! - [`MemoryCache`] - id -> document map with defensive copies, silent
//!   warm-up, diff-gated update notification, wildcard listeners, and
//!   query-fingerprint memoization.
//! - [`PassthroughCache`] - pure pass-through. Callers stay agnostic to
//!   whether caching is enabled, which is what allows a staged rollout from
//!   "everything local" to "cached remote calls" without touching call sites.
//!
//! # Notification rules
//!
//! | op       | notifies                                                  |
//! |----------|-----------------------------------------------------------|
//! | `load`   | never (warm-up is silent)                                 |
//! | `add`    | always                                                    |
//! | `update` | only if a non-object leaf field other than `updated_at` changed |
//! | `remove` | only if an entry existed                                  |
//!
//! Id-specific listeners fire before wildcard (`"*"`) listeners. Listener
//! callbacks may themselves mutate the cache: nested notifications are queued
//! and drained in order rather than dispatched recursively, so reentrancy
//! cannot recurse unboundedly.
//!
//! # What this layer does not do
//!
//! - No single-flight de-duplication: two concurrent `get` calls for the same
//!   missing id may both invoke their fallback; last writer wins.
//! - No error interpretation: fallback errors propagate unchanged.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use crate::entity::{document_id, Document, FIELD_UPDATED_AT};
use crate::error::Result;
use crate::query::Query;
use crate::scope::Subscription;

/// Listener target meaning "every id in this namespace".
pub const WILDCARD_ID: &str = "*";

// =============================================================================
// Operations and Events
// =============================================================================

/// Operation tag attached to a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    /// Silent warm-up from a backend read.
    Load,
    /// New entity.
    Add,
    /// Changed entity.
    Update,
    /// Entity evicted via [`EntityCache::remove`].
    Remove,
}

impl CacheOp {
    /// Lowercase tag name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOp::Load => "load",
            CacheOp::Add => "add",
            CacheOp::Update => "update",
            CacheOp::Remove => "remove",
        }
    }
}

impl std::fmt::Display for CacheOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to change listeners when a notifying write happens.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Id of the affected entity.
    pub id: String,
    /// What happened.
    pub op: CacheOp,
    /// The written value; `None` for removals.
    pub value: Option<Document>,
}

/// Change listener callback.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Async fallback loader for a single document.
pub type DocLoader<'a> = BoxFuture<'a, Result<Option<Document>>>;

/// Async fallback loader for a query result.
pub type DocsLoader<'a> = BoxFuture<'a, Result<Vec<Document>>>;

// =============================================================================
// Cache Interface
// =============================================================================

/// One cache namespace, keyed by entity id.
///
/// The namespace string is typically `${instance}/${entity_type}`, letting
/// multiple logical data environments coexist without collision.
#[async_trait]
pub trait EntityCache: Send + Sync {
    /// The namespace this cache partitions.
    fn namespace(&self) -> &str;

    /// Return the cached value, or invoke `fallback` and (if it yields a
    /// value) store the result under `load` before returning it.
    async fn get(&self, id: &str, fallback: DocLoader<'_>) -> Result<Option<Document>>;

    /// Serve a previously-fingerprinted query by scanning the cache,
    /// re-applying its predicates in memory; otherwise invoke `fallback`,
    /// store every returned entity under `load`, and mark the fingerprint
    /// loaded.
    async fn query(&self, query: &Query, fallback: DocsLoader<'_>) -> Result<Vec<Document>>;

    /// Store a value under an operation tag. See the notification rules in
    /// the module docs.
    fn put(&self, id: &str, op: CacheOp, value: Document);

    /// Delete an entry; emits a `remove` event only if one existed.
    fn remove(&self, id: &str);

    /// Whether an entry exists.
    fn has(&self, id: &str) -> bool;

    /// Evict without emitting any event (cache bypass without repopulation).
    fn invalidate(&self, id: &str);

    /// Drop a query's fingerprint so the next [`EntityCache::query`] for the
    /// same filter combination invokes its fallback again. Cached entities
    /// stay put; only the "fully loaded" mark is cleared.
    fn invalidate_query(&self, query: &Query);

    /// Subscribe to one or more ids, or to [`WILDCARD_ID`].
    fn listen(&self, ids: &[&str], listener: ChangeListener) -> Subscription;
}

// =============================================================================
// In-Memory Cache
// =============================================================================

struct ListenerTable {
    registrations: DashMap<String, Vec<(u64, ChangeListener)>>,
    next_handle: AtomicU64,
}

struct NotificationQueue {
    queue: VecDeque<ChangeEvent>,
    draining: bool,
}

/// In-memory [`EntityCache`] with change listeners and query memoization.
pub struct MemoryCache {
    namespace: String,
    entries: DashMap<String, Document>,
    listeners: Arc<ListenerTable>,
    loaded_queries: DashSet<String>,
    pending: Mutex<NotificationQueue>,
}

impl MemoryCache {
    /// Create an empty cache for a namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: DashMap::new(),
            listeners: Arc::new(ListenerTable {
                registrations: DashMap::new(),
                next_handle: AtomicU64::new(1),
            }),
            loaded_queries: DashSet::new(),
            pending: Mutex::new(NotificationQueue {
                queue: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Enqueue an event and drain the queue unless a drain is already in
    /// progress higher up the stack. Nested notifications triggered from
    /// inside a listener are appended and picked up by the outer drain.
    fn notify(&self, event: ChangeEvent) {
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.queue.push_back(event);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        loop {
            let event = {
                let mut pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match pending.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };

            // Id-specific listeners first, then wildcard. Guards are dropped
            // before any callback runs so listeners can re-enter the cache.
            let mut targets: Vec<ChangeListener> = Vec::new();
            if let Some(entry) = self.listeners.registrations.get(&event.id) {
                targets.extend(entry.iter().map(|(_, cb)| Arc::clone(cb)));
            }
            if let Some(entry) = self.listeners.registrations.get(WILDCARD_ID) {
                targets.extend(entry.iter().map(|(_, cb)| Arc::clone(cb)));
            }
            for listener in targets {
                listener(&event);
            }
        }
    }
}

/// Field-by-field shallow comparison of non-object leaf fields, excluding
/// `updated_at` so touch-only updates do not spuriously notify.
fn leaf_fields_changed(previous: &Document, next: &Document) -> bool {
    let keys = previous.keys().chain(next.keys());
    for key in keys {
        if key == FIELD_UPDATED_AT {
            continue;
        }
        let before = previous.get(key).unwrap_or(&serde_json::Value::Null);
        let after = next.get(key).unwrap_or(&serde_json::Value::Null);
        if before.is_object() || after.is_object() {
            continue;
        }
        if before != after {
            return true;
        }
    }
    false
}

#[async_trait]
impl EntityCache for MemoryCache {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, id: &str, fallback: DocLoader<'_>) -> Result<Option<Document>> {
        if let Some(entry) = self.entries.get(id) {
            trace!(namespace = %self.namespace, id, "cache hit");
            return Ok(Some(entry.clone()));
        }

        trace!(namespace = %self.namespace, id, "cache miss");
        let loaded = fallback.await?;
        if let Some(doc) = &loaded {
            self.put(id, CacheOp::Load, doc.clone());
        }
        Ok(loaded)
    }

    async fn query(&self, query: &Query, fallback: DocsLoader<'_>) -> Result<Vec<Document>> {
        let fingerprint = query.fingerprint();
        if self.loaded_queries.contains(&fingerprint) {
            debug!(
                namespace = %self.namespace,
                fingerprint = %fingerprint,
                "query served from cache scan"
            );
            let docs: Vec<Document> = self.entries.iter().map(|entry| entry.value().clone()).collect();
            return Ok(query.apply(docs));
        }

        let docs = fallback.await?;
        for doc in &docs {
            match document_id(doc) {
                Some(id) => {
                    let id = id.to_string();
                    self.put(&id, CacheOp::Load, doc.clone());
                }
                None => warn!(
                    namespace = %self.namespace,
                    "query result without an id was not cached"
                ),
            }
        }
        self.loaded_queries.insert(fingerprint);
        Ok(docs)
    }

    fn put(&self, id: &str, op: CacheOp, value: Document) {
        let previous = self.entries.insert(id.to_string(), value.clone());
        let notifies = match op {
            CacheOp::Add => true,
            CacheOp::Update => previous
                .as_ref()
                .map_or(true, |before| leaf_fields_changed(before, &value)),
            CacheOp::Load | CacheOp::Remove => false,
        };
        trace!(namespace = %self.namespace, id, op = %op, notifies, "cache put");
        if notifies {
            self.notify(ChangeEvent {
                id: id.to_string(),
                op,
                value: Some(value),
            });
        }
    }

    fn remove(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            trace!(namespace = %self.namespace, id, "cache remove");
            self.notify(ChangeEvent {
                id: id.to_string(),
                op: CacheOp::Remove,
                value: None,
            });
        }
    }

    fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn invalidate(&self, id: &str) {
        trace!(namespace = %self.namespace, id, "cache invalidate");
        self.entries.remove(id);
    }

    fn invalidate_query(&self, query: &Query) {
        let fingerprint = query.fingerprint();
        trace!(namespace = %self.namespace, fingerprint = %fingerprint, "query invalidate");
        self.loaded_queries.remove(&fingerprint);
    }

    fn listen(&self, ids: &[&str], listener: ChangeListener) -> Subscription {
        let handle = self.listeners.next_handle.fetch_add(1, Ordering::Relaxed);
        for id in ids {
            self.listeners
                .registrations
                .entry((*id).to_string())
                .or_default()
                .push((handle, Arc::clone(&listener)));
        }

        let table = Arc::clone(&self.listeners);
        let keys: Vec<String> = ids.iter().map(|id| (*id).to_string()).collect();
        Subscription::new(move || {
            for key in &keys {
                if let Some(mut entry) = table.registrations.get_mut(key) {
                    entry.retain(|(h, _)| *h != handle);
                }
                // Prune empty lists so the listener map cannot grow unboundedly.
                table
                    .registrations
                    .remove_if(key, |_, registrations| registrations.is_empty());
            }
        })
    }
}

// =============================================================================
// Pass-Through Cache
// =============================================================================

/// The no-cache variant: every read goes to the fallback, nothing is stored,
/// listeners never fire. Satisfies the same interface as [`MemoryCache`].
pub struct PassthroughCache {
    namespace: String,
}

impl PassthroughCache {
    /// Create a pass-through cache for a namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl EntityCache for PassthroughCache {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, _id: &str, fallback: DocLoader<'_>) -> Result<Option<Document>> {
        fallback.await
    }

    async fn query(&self, _query: &Query, fallback: DocsLoader<'_>) -> Result<Vec<Document>> {
        fallback.await
    }

    fn put(&self, _id: &str, _op: CacheOp, _value: Document) {}

    fn remove(&self, _id: &str) {}

    fn has(&self, _id: &str) -> bool {
        false
    }

    fn invalidate(&self, _id: &str) {}

    fn invalidate_query(&self, _query: &Query) {}

    fn listen(&self, _ids: &[&str], _listener: ChangeListener) -> Subscription {
        Subscription::inert()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test doc must be an object"),
        }
    }

    fn record(events: &Arc<StdMutex<Vec<(String, CacheOp)>>>) -> ChangeListener {
        let sink = Arc::clone(events);
        Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push((event.id.clone(), event.op));
        })
    }

    #[tokio::test]
    async fn test_get_populates_once() {
        let cache = MemoryCache::new("test/user");
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        let first = cache
            .get(
                "u1",
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(doc(json!({"id": "u1", "name": "Ann"}))))
                }),
            )
            .await
            .unwrap();
        assert_eq!(first.unwrap().get("name").unwrap(), "Ann");
        assert!(cache.has("u1"));

        // Second call must be served from cache without invoking the loader.
        let second = cache
            .get(
                "u1",
                Box::pin(async { panic!("fallback must not be invoked") }),
            )
            .await
            .unwrap();
        assert_eq!(second.unwrap().get("name").unwrap(), "Ann");
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_null_fallback_result_is_not_cached() {
        let cache = MemoryCache::new("test/user");
        let missing = cache.get("u9", Box::pin(async { Ok(None) })).await.unwrap();
        assert!(missing.is_none());
        assert!(!cache.has("u9"));
    }

    #[tokio::test]
    async fn test_fallback_errors_propagate_unchanged() {
        let cache = MemoryCache::new("test/user");
        let result = cache
            .get(
                "u1",
                Box::pin(async { Err(anyhow::anyhow!("backend down").into()) }),
            )
            .await;
        assert!(result.unwrap_err().to_string().contains("backend down"));
        assert!(!cache.has("u1"));
    }

    #[test]
    fn test_add_always_notifies_id_and_wildcard() {
        let cache = MemoryCache::new("test/user");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let _by_id = cache.listen(&["u1"], record(&events));
        let _wild = cache.listen(&[WILDCARD_ID], record(&events));

        cache.put("u1", CacheOp::Add, doc(json!({"id": "u1", "name": "Ann"})));

        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("u1".to_string(), CacheOp::Add));
        assert_eq!(seen[1], ("u1".to_string(), CacheOp::Add));
    }

    #[test]
    fn test_load_is_silent() {
        let cache = MemoryCache::new("test/user");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let _sub = cache.listen(&[WILDCARD_ID], record(&events));

        cache.put("u1", CacheOp::Load, doc(json!({"id": "u1", "name": "Ann"})));
        assert!(events.lock().unwrap().is_empty());
        assert!(cache.has("u1"));
    }

    #[test]
    fn test_update_notifies_only_on_leaf_change() {
        let cache = MemoryCache::new("test/user");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let _sub = cache.listen(&["u1"], record(&events));

        cache.put(
            "u1",
            CacheOp::Load,
            doc(json!({"id": "u1", "name": "Ann", "updated_at": "T1"})),
        );

        // Only updated_at differs: no notification.
        cache.put(
            "u1",
            CacheOp::Update,
            doc(json!({"id": "u1", "name": "Ann", "updated_at": "T2"})),
        );
        assert!(events.lock().unwrap().is_empty());

        // A real leaf change notifies.
        cache.put(
            "u1",
            CacheOp::Update,
            doc(json!({"id": "u1", "name": "Anne", "updated_at": "T3"})),
        );
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_update_ignores_object_valued_fields() {
        let cache = MemoryCache::new("test/user");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let _sub = cache.listen(&["u1"], record(&events));

        cache.put(
            "u1",
            CacheOp::Load,
            doc(json!({"id": "u1", "profile": {"bio": "a"}})),
        );
        cache.put(
            "u1",
            CacheOp::Update,
            doc(json!({"id": "u1", "profile": {"bio": "b"}})),
        );
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_notifies_only_when_present() {
        let cache = MemoryCache::new("test/user");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let _sub = cache.listen(&["u1"], record(&events));

        cache.remove("u1");
        assert!(events.lock().unwrap().is_empty());

        cache.put("u1", CacheOp::Load, doc(json!({"id": "u1"})));
        cache.remove("u1");
        assert_eq!(
            *events.lock().unwrap(),
            vec![("u1".to_string(), CacheOp::Remove)]
        );
        assert!(!cache.has("u1"));
    }

    #[test]
    fn test_invalidate_is_silent() {
        let cache = MemoryCache::new("test/user");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let _sub = cache.listen(&[WILDCARD_ID], record(&events));

        cache.put("u1", CacheOp::Load, doc(json!({"id": "u1"})));
        cache.invalidate("u1");
        assert!(!cache.has("u1"));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_prunes_empty_lists() {
        let cache = MemoryCache::new("test/user");
        let sub = cache.listen(&["u1", "u2"], Arc::new(|_| {}));
        assert_eq!(cache.listeners.registrations.len(), 2);

        sub.unsubscribe();
        assert_eq!(cache.listeners.registrations.len(), 0);
    }

    #[test]
    fn test_reentrant_put_from_listener_is_queued_not_recursive() {
        let cache = Arc::new(MemoryCache::new("test/user"));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let reentrant = Arc::clone(&cache);
        let sink = Arc::clone(&order);
        let _sub = cache.listen(
            &[WILDCARD_ID],
            Arc::new(move |event: &ChangeEvent| {
                sink.lock().unwrap().push(event.id.clone());
                if event.id == "u1" {
                    // Triggers a nested notification; it must be deferred
                    // until this callback returns.
                    reentrant.put("u2", CacheOp::Add, doc(json!({"id": "u2"})));
                    sink.lock().unwrap().push("after-nested-put".to_string());
                }
            }),
        );

        cache.put("u1", CacheOp::Add, doc(json!({"id": "u1"})));

        let seen = order.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "u1".to_string(),
                "after-nested-put".to_string(),
                "u2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_query_fingerprint_replay_scans_cache() {
        use crate::query::FilterOp;

        let cache = MemoryCache::new("test/user");
        let calls = Arc::new(AtomicUsize::new(0));

        let q = Query::new().filter("role", FilterOp::Eq, "admin");
        let seen = Arc::clone(&calls);
        let first = cache
            .query(
                &q,
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::Relaxed);
                    Ok(vec![
                        doc(json!({"id": "u1", "role": "admin"})),
                        doc(json!({"id": "u2", "role": "admin"})),
                    ])
                }),
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        // Same predicates, different declaration order: served from cache.
        let repeat = Query::new().filter("role", FilterOp::Eq, "admin");
        let second = cache
            .query(
                &repeat,
                Box::pin(async { panic!("fallback must not be invoked") }),
            )
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // The scan re-applies predicates: a cached non-admin is filtered out.
        cache.put("u3", CacheOp::Load, doc(json!({"id": "u3", "role": "viewer"})));
        let third = cache
            .query(&repeat, Box::pin(async { panic!("cached") }))
            .await
            .unwrap();
        assert_eq!(third.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_query_clears_the_fingerprint() {
        use crate::query::FilterOp;

        let cache = MemoryCache::new("test/user");
        let q = Query::new().filter("role", FilterOp::Eq, "admin");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let seen = Arc::clone(&calls);
            cache
                .query(
                    &q,
                    Box::pin(async move {
                        seen.fetch_add(1, Ordering::Relaxed);
                        Ok(vec![doc(json!({"id": "u1", "role": "admin"}))])
                    }),
                )
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // Clearing the fingerprint sends the next repeat back to the
        // fallback; the cached entity itself survives.
        cache.invalidate_query(&q);
        assert!(cache.has("u1"));

        let seen = Arc::clone(&calls);
        cache
            .query(
                &q,
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::Relaxed);
                    Ok(vec![doc(json!({"id": "u1", "role": "admin"}))])
                }),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_passthrough_never_stores() {
        let cache = PassthroughCache::new("test/user");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let seen = Arc::clone(&calls);
            let result = cache
                .get(
                    "u1",
                    Box::pin(async move {
                        seen.fetch_add(1, Ordering::Relaxed);
                        Ok(Some(doc(json!({"id": "u1"}))))
                    }),
                )
                .await
                .unwrap();
            assert!(result.is_some());
        }

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(!cache.has("u1"));

        let sub = cache.listen(&["u1"], Arc::new(|_| {}));
        sub.unsubscribe();
    }
}
