//! Structured error types for lattice.
//!
//! `LatticeError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. The cache and provider layers never swallow collaborator
//! errors; they only add their own fatal conditions:
//!
//! - [`LatticeError::UnregisteredKey`] - provider resolution found no
//!   provider, no ancestor provider, and no key default.
//! - [`LatticeError::NotFound`] - `required()` called for an id absent from
//!   both cache and backend. Distinguishable from other failures so a caller
//!   can render a not-found state.
//! - [`LatticeError::SchemaMismatch`] - an inverse edge was requested but the
//!   target schema declares no forward reference back to the source type.
//!   A programming error, never retried.
//! - [`LatticeError::Backend`] - propagated unchanged from the backend
//!   collaborator. `anyhow` is the internal transport for backend failures;
//!   no retry policy and no automatic rollback of optimistic cache writes.
//!
//! # Example
//!
//! ```ignore
//! match store.required("user:123", GetOptions::default()).await {
//!     Ok(user) => render(user),
//!     Err(LatticeError::NotFound { entity_type, id }) => render_not_found(entity_type, id),
//!     Err(e) => fail(e),
//! }
//! ```

use thiserror::Error;

use crate::entity::EntityType;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LatticeError>;

/// Structured error type for lattice operations.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// Resolution requested for a key with no provider anywhere up the scope
    /// chain and no configured default.
    #[error("no provider registered for key `{key}`")]
    UnregisteredKey {
        /// Debug name of the key that failed to resolve.
        key: &'static str,
    },

    /// `required()` found nothing in cache or backend for this id.
    #[error("{entity_type} `{id}` not found")]
    NotFound {
        /// Entity type that was requested.
        entity_type: EntityType,
        /// The id that resolved to nothing.
        id: String,
    },

    /// An inverse edge names a relationship the target schema does not declare.
    #[error(
        "inverse field `{field}` on {source_type} expects {target} to forward-reference \
         {source_type}, but no such field exists"
    )]
    SchemaMismatch {
        /// Entity type being walked. Not named `source`: thiserror reserves
        /// that name for the error chain.
        source_type: EntityType,
        /// Entity type the inverse field points at.
        target: EntityType,
        /// The inverse field that triggered the walk.
        field: &'static str,
    },

    /// Edge walking reached an entity type whose store was never registered
    /// with the factory.
    #[error("no data store registered for entity type {entity_type}")]
    StoreUnregistered {
        /// The entity type with no registered store.
        entity_type: EntityType,
    },

    /// `update` requires an entity that already carries an id.
    #[error("cannot update {entity_type} without an id")]
    MissingId {
        /// Entity type of the rejected update.
        entity_type: EntityType,
    },

    /// An entity failed to convert to or from its document form.
    #[error("failed to encode or decode {entity_type} document: {source}")]
    Codec {
        /// Entity type being converted.
        entity_type: EntityType,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Propagated unchanged from the backend collaborator.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl LatticeError {
    /// Returns true for the not-found condition, so UI callers can branch
    /// without a full match.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LatticeError::NotFound { .. })
    }
}
