//! Backend abstraction: where documents actually live.
//!
//! A [`Backend`] is the persistence collaborator behind every data store -
//! a document database client, an HTTP API, or the in-memory test backend in
//! [`testing`](crate::testing). One backend instance serves all entity types;
//! operations carry the [`EntityType`] so the backend can route to the right
//! collection or table.
//!
//! The caching layer above treats backends as opaque: errors propagate
//! unchanged (wrapped in [`LatticeError::Backend`](crate::LatticeError) via
//! `anyhow`), and no retry policy lives here.

use async_trait::async_trait;

use crate::entity::{Document, EntityType};
use crate::error::Result;
use crate::query::Query;

/// Persistence operations over documents, keyed by entity type and id.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch one document by id. `Ok(None)` means the id does not exist;
    /// errors are reserved for transport or server failures.
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Document>>;

    /// Persist a new document. The store has already minted an id and
    /// stamped timestamps; the backend must return the stored form, which
    /// may include server-assigned fields.
    async fn create(&self, entity_type: EntityType, doc: Document) -> Result<Document>;

    /// Persist changed fields of an existing document and return the stored
    /// form.
    async fn update(&self, entity_type: EntityType, doc: Document) -> Result<Document>;

    /// Delete by id. Deleting an id that does not exist is not an error.
    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<()>;

    /// Execute a query and return matching documents.
    async fn query(&self, entity_type: EntityType, query: &Query) -> Result<Vec<Document>>;
}
