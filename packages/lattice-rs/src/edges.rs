//! Recursive edge loading over cached documents.
//!
//! The walker turns stored ids into embedded documents, driven by two things:
//! the entity's static [`EntitySchema`](crate::EntitySchema) (which fields are
//! edges, and of what kind) and the caller's [`EdgeSelector`] list (which
//! edges to follow, and how deep).
//!
//! Forward references replace an id string (or array of id strings) with the
//! loaded target document. Inverse references are computed: the walker queries
//! the target type for documents whose declared `via` field holds this
//! entity's id. Both kinds recurse - a loaded target is itself walked with the
//! same selector set, so `post -> comments -> author` resolves in one call.
//!
//! # Selector claims
//!
//! Selectors are consumable. [`EdgeSelector::all`] matches every traversal of
//! edges into its type and is never used up. [`EdgeSelector::bounded`] holds a
//! budget: each traversal of a matching `(source, target)` edge decrements it,
//! and at zero the selector stops matching. The budget is shared across every
//! branch of one root call, which is what keeps self-referential schemas
//! (`user.mentor -> user`) from recursing unboundedly - as long as cyclic
//! edges use bounded selectors. An `all` selector over a cyclic graph will
//! not terminate; that is the caller's contract to uphold.
//!
//! Unclaimed edges are left as they are stored: ids stay ids.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{try_join_all, BoxFuture};
use serde_json::Value;
use tracing::trace;

use crate::entity::{document_id, Document, EntitySchema, EntityType, FieldKind};
use crate::error::{LatticeError, Result};
use crate::factory::StoreFactory;
use crate::query::{FilterOp, Query};

// =============================================================================
// Selectors
// =============================================================================

/// One edge-loading instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSelector {
    /// Follow every edge into this entity type, at any depth.
    All(EntityType),
    /// Follow edges from `source` to `target` at most `depth` times, shared
    /// across all branches of one load.
    Bounded {
        /// Entity type the edge starts from.
        source: EntityType,
        /// Entity type the edge points at.
        target: EntityType,
        /// Remaining traversal budget.
        depth: u32,
    },
}

impl EdgeSelector {
    /// Follow every edge into `target`, at any depth.
    pub fn all(target: EntityType) -> Self {
        EdgeSelector::All(target)
    }

    /// Follow `source -> target` edges at most `depth` times per load.
    pub fn bounded(source: EntityType, target: EntityType, depth: u32) -> Self {
        EdgeSelector::Bounded {
            source,
            target,
            depth,
        }
    }
}

/// The mutable selector state for one root load. Clones share the budget, so
/// sibling branches spend from the same bounded depth.
#[derive(Clone)]
pub(crate) struct SelectorSet {
    selectors: Arc<Mutex<Vec<EdgeSelector>>>,
}

impl SelectorSet {
    pub(crate) fn root(selectors: &[EdgeSelector]) -> Self {
        Self {
            selectors: Arc::new(Mutex::new(selectors.to_vec())),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.selectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Consume a traversal of a `source -> target` edge, if a selector allows
    /// it. `All` selectors match without being spent; bounded selectors are
    /// decremented and stop matching at zero.
    pub(crate) fn claim(&self, source: EntityType, target: EntityType) -> bool {
        let mut selectors = self
            .selectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for selector in selectors.iter_mut() {
            match selector {
                EdgeSelector::All(t) if *t == target => return true,
                EdgeSelector::Bounded {
                    source: s,
                    target: t,
                    depth,
                } if *s == source && *t == target && *depth > 0 => {
                    *depth -= 1;
                    return true;
                }
                _ => {}
            }
        }
        false
    }
}

// =============================================================================
// Erased Store Access
// =============================================================================

/// Document-level view of a data store, used by the walker to cross entity
/// types without knowing their Rust types.
#[async_trait::async_trait]
pub(crate) trait DocumentStore: Send + Sync {
    /// The static schema of the stored entity type.
    fn schema(&self) -> &'static EntitySchema;

    /// Load one document and walk its edges with the shared selector set.
    async fn load_with_edges(&self, id: &str, selectors: SelectorSet)
        -> Result<Option<Document>>;

    /// Query documents and walk their edges with the shared selector set.
    async fn query_with_edges(&self, query: Query, selectors: SelectorSet)
        -> Result<Vec<Document>>;
}

// =============================================================================
// Walker
// =============================================================================

struct Patch {
    index: usize,
    field: &'static str,
    value: Value,
}

/// Walk every claimed edge field of `docs` in place. Each `(field, batch)`
/// pair claims its selector once, then loads per entity concurrently; all
/// loads finish before any patch is applied, so the batch converges together.
pub(crate) async fn walk(
    factory: &Arc<StoreFactory>,
    schema: &'static EntitySchema,
    docs: &mut [Document],
    selectors: &SelectorSet,
) -> Result<()> {
    if selectors.is_empty() || docs.is_empty() {
        return Ok(());
    }

    let source = schema.entity_type;
    let mut tasks: Vec<BoxFuture<'static, Result<Option<Patch>>>> = Vec::new();

    for field in schema.fields {
        match field.kind {
            FieldKind::Scalar => {}
            FieldKind::ForwardRef { target, array } => {
                if !selectors.claim(source, target) {
                    continue;
                }
                trace!(source = %source, target = %target, field = field.name, "walking forward edge");
                for (index, doc) in docs.iter().enumerate() {
                    let Some(stored) = doc.get(field.name) else {
                        continue;
                    };
                    if array {
                        let Some(elements) = stored.as_array() else {
                            continue;
                        };
                        let elements = elements.clone();
                        let store = factory.erased(target)?;
                        let branch = selectors.clone();
                        let name = field.name;
                        tasks.push(Box::pin(async move {
                            let mut loaded = Vec::with_capacity(elements.len());
                            for element in elements {
                                match element.as_str() {
                                    Some(id) => {
                                        match store.load_with_edges(id, branch.clone()).await? {
                                            Some(doc) => loaded.push(Value::Object(doc)),
                                            None => loaded.push(element),
                                        }
                                    }
                                    // Already embedded, or malformed: keep as-is.
                                    None => loaded.push(element),
                                }
                            }
                            Ok(Some(Patch {
                                index,
                                field: name,
                                value: Value::Array(loaded),
                            }))
                        }));
                    } else {
                        let Some(id) = stored.as_str() else {
                            continue;
                        };
                        let id = id.to_string();
                        let store = factory.erased(target)?;
                        let branch = selectors.clone();
                        let name = field.name;
                        tasks.push(Box::pin(async move {
                            match store.load_with_edges(&id, branch).await? {
                                Some(doc) => Ok(Some(Patch {
                                    index,
                                    field: name,
                                    value: Value::Object(doc),
                                })),
                                // Dangling reference: leave the id in place.
                                None => Ok(None),
                            }
                        }));
                    }
                }
            }
            FieldKind::InverseRef { target, via, array } => {
                if !selectors.claim(source, target) {
                    continue;
                }
                let store = factory.erased(target)?;

                // The inverse edge is only as real as the forward field it
                // mirrors. Validate once per batch.
                let forward_points_back = matches!(
                    store.schema().field(via).map(|f| f.kind),
                    Some(FieldKind::ForwardRef { target: t, .. }) if t == source
                );
                if !forward_points_back {
                    return Err(LatticeError::SchemaMismatch {
                        source_type: source,
                        target,
                        field: field.name,
                    });
                }

                trace!(source = %source, target = %target, field = field.name, via, "walking inverse edge");
                for (index, doc) in docs.iter().enumerate() {
                    let Some(id) = document_id(doc) else {
                        continue;
                    };
                    let query = Query::new().filter(via, FilterOp::Eq, id);
                    let store = Arc::clone(&store);
                    let branch = selectors.clone();
                    let name = field.name;
                    tasks.push(Box::pin(async move {
                        let mut matches = store.query_with_edges(query, branch).await?;
                        let value = if array {
                            Value::Array(matches.drain(..).map(Value::Object).collect())
                        } else {
                            matches
                                .drain(..)
                                .next()
                                .map(Value::Object)
                                .unwrap_or(Value::Null)
                        };
                        Ok(Some(Patch {
                            index,
                            field: name,
                            value,
                        }))
                    }));
                }
            }
        }
    }

    // Wait-all barrier: no patch lands until every branch has loaded.
    let patches = try_join_all(tasks).await?;
    for patch in patches.into_iter().flatten() {
        docs[patch.index].insert(patch.field.to_string(), patch.value);
    }
    Ok(())
}
