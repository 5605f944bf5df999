//! Test support: an in-memory backend with call counters and failure
//! injection, plus a small fixture entity graph (`User`, `Post`, `Comment`).
//!
//! Available to downstream crates behind the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! lattice = { version = "0.1", features = ["testing"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::entity::{
    document_id, Document, Entity, EntitySchema, EntityType, FieldSchema, Ref,
};
use crate::error::Result;
use crate::query::Query;

// =============================================================================
// In-Memory Backend
// =============================================================================

/// In-memory [`Backend`] with per-operation call counters and one-shot
/// failure injection. Counters make cache behavior observable: a read served
/// from cache leaves `reads()` untouched.
#[derive(Default)]
pub struct MemoryBackend {
    tables: DashMap<EntityType, HashMap<String, Document>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    queries: AtomicUsize,
    removes: AtomicUsize,
    fail_next: Mutex<Option<String>>,
}

impl MemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls that reached this backend.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `create` + `update` calls that reached this backend.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of `query` calls that reached this backend.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of `remove` calls that reached this backend.
    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::Relaxed)
    }

    /// Make the next backend operation fail with this message.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Seed a document directly, bypassing counters and failure injection.
    pub fn insert_raw(&self, entity_type: EntityType, doc: Document) {
        if let Some(id) = document_id(&doc) {
            let id = id.to_string();
            self.tables.entry(entity_type).or_default().insert(id, doc);
        }
    }

    fn take_failure(&self) -> Result<()> {
        let injected = self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match injected {
            Some(message) => Err(anyhow::anyhow!(message).into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Document>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        Ok(self
            .tables
            .get(&entity_type)
            .and_then(|table| table.get(id).cloned()))
    }

    async fn create(&self, entity_type: EntityType, doc: Document) -> Result<Document> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        let id = document_id(&doc)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("create requires an id"))?;
        self.tables
            .entry(entity_type)
            .or_default()
            .insert(id, doc.clone());
        Ok(doc)
    }

    async fn update(&self, entity_type: EntityType, doc: Document) -> Result<Document> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        let id = document_id(&doc)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("update requires an id"))?;

        let mut table = self.tables.entry(entity_type).or_default();
        let existing = table
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("cannot update missing {entity_type} `{id}`"))?;
        for (key, value) in doc {
            existing.insert(key, value);
        }
        Ok(existing.clone())
    }

    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        if let Some(mut table) = self.tables.get_mut(&entity_type) {
            table.remove(id);
        }
        Ok(())
    }

    async fn query(&self, entity_type: EntityType, query: &Query) -> Result<Vec<Document>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.take_failure()?;
        let docs = self
            .tables
            .get(&entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        Ok(query.apply(docs))
    }
}

// =============================================================================
// Fixture Entities
// =============================================================================

/// Fixture type token for [`User`].
pub const USER: EntityType = EntityType::new("user");
/// Fixture type token for [`Post`].
pub const POST: EntityType = EntityType::new("post");
/// Fixture type token for [`Comment`].
pub const COMMENT: EntityType = EntityType::new("comment");

static USER_SCHEMA: EntitySchema = EntitySchema {
    entity_type: USER,
    fields: &[
        FieldSchema::scalar("id"),
        FieldSchema::scalar("created_at"),
        FieldSchema::scalar("updated_at"),
        FieldSchema::scalar("name"),
        FieldSchema::scalar("email"),
        FieldSchema::forward("mentor", USER),
    ],
};

static POST_SCHEMA: EntitySchema = EntitySchema {
    entity_type: POST,
    fields: &[
        FieldSchema::scalar("id"),
        FieldSchema::scalar("created_at"),
        FieldSchema::scalar("updated_at"),
        FieldSchema::scalar("title"),
        FieldSchema::forward("author", USER),
        FieldSchema::inverse_array("comments", COMMENT, "post"),
    ],
};

static COMMENT_SCHEMA: EntitySchema = EntitySchema {
    entity_type: COMMENT,
    fields: &[
        FieldSchema::scalar("id"),
        FieldSchema::scalar("created_at"),
        FieldSchema::scalar("updated_at"),
        FieldSchema::scalar("body"),
        FieldSchema::forward("post", POST),
    ],
};

/// Fixture user. `mentor` is a self-referential forward edge, useful for
/// exercising bounded recursion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Entity id; empty means not yet created.
    pub id: String,
    /// Creation timestamp, stamped by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Update timestamp, stamped by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Display name.
    pub name: String,
    /// Optional contact address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Self-referential forward edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentor: Option<Ref<User>>,
}

impl User {
    /// A minimal user fixture.
    pub fn fixture(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            name: name.into(),
            email: None,
            mentor: None,
        }
    }
}

impl Entity for User {
    fn schema() -> &'static EntitySchema {
        &USER_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Fixture post with a forward `author` edge and an inverse `comments` edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Entity id; empty means not yet created.
    pub id: String,
    /// Creation timestamp, stamped by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Update timestamp, stamped by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Post title.
    pub title: String,
    /// Forward edge to the authoring user.
    pub author: Ref<User>,
    /// Computed back-edge; populated only by edge loading, never persisted.
    #[serde(default, skip_serializing)]
    pub comments: Vec<Comment>,
}

impl Post {
    /// A minimal post fixture referencing an author by id.
    pub fn fixture(
        id: impl Into<String>,
        title: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            title: title.into(),
            author: Ref::new(author_id.into()),
            comments: Vec::new(),
        }
    }
}

impl Entity for Post {
    fn schema() -> &'static EntitySchema {
        &POST_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Fixture comment with a forward `post` edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// Entity id; empty means not yet created.
    pub id: String,
    /// Creation timestamp, stamped by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Update timestamp, stamped by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Comment text.
    pub body: String,
    /// Forward edge to the commented post.
    pub post: Ref<Post>,
}

impl Comment {
    /// A minimal comment fixture referencing a post by id.
    pub fn fixture(
        id: impl Into<String>,
        body: impl Into<String>,
        post_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            body: body.into(),
            post: Ref::new(post_id.into()),
        }
    }
}

impl Entity for Comment {
    fn schema() -> &'static EntitySchema {
        &COMMENT_SCHEMA
    }

    fn id(&self) -> &str {
        &self.id
    }
}
