//! Entities, statically declared schemas, and the document form.
//!
//! # Documents
//!
//! Entities cross the cache and backend boundaries as JSON documents
//! ([`Document`], a `serde_json` object map). Typed entities implement
//! [`Entity`] and convert at the facade boundary with [`to_document`] /
//! [`from_document`].
//!
//! # Schemas
//!
//! Relationship edges are declared statically, not discovered by runtime
//! reflection. Each entity carries a `&'static` [`EntitySchema`] mapping field
//! names to a tagged [`FieldKind`]:
//!
//! - `Scalar` - plain data, ignored by the edge walker.
//! - `ForwardRef` - this entity stores the id (or ids) of the target type.
//! - `InverseRef` - a virtual back-edge, computed by querying the target type
//!   for a matching forward reference. Never persisted on the owning entity.
//!
//! # Example
//!
//! ```ignore
//! static POST_SCHEMA: EntitySchema = EntitySchema {
//!     entity_type: EntityType::new("post"),
//!     fields: &[
//!         FieldSchema::scalar("id"),
//!         FieldSchema::scalar("title"),
//!         FieldSchema::forward("author", USER),
//!         FieldSchema::inverse_array("comments", COMMENT, "post"),
//!     ],
//! };
//!
//! impl Entity for Post {
//!     fn schema() -> &'static EntitySchema { &POST_SCHEMA }
//!     fn id(&self) -> &str { &self.id }
//! }
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{LatticeError, Result};

/// The wire/cache form of an entity: a JSON object map.
pub type Document = serde_json::Map<String, Value>;

/// Document field holding the entity id.
pub const FIELD_ID: &str = "id";
/// Document field stamped at creation time if absent.
pub const FIELD_CREATED_AT: &str = "created_at";
/// Document field stamped on every update. Excluded from change diffing so
/// touch-only updates do not notify listeners.
pub const FIELD_UPDATED_AT: &str = "updated_at";

// =============================================================================
// Entity Type
// =============================================================================

/// Opaque token naming an entity type (`"user"`, `"post"`, ...).
///
/// Used to key cache namespaces, data stores, and edge selectors. Compared by
/// name; declare each token exactly once as a `const`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityType(&'static str);

impl EntityType {
    /// Create a type token. Intended for `const` declarations.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The token's name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Tagged description of a schema field, consulted by the edge walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain data; never walked.
    Scalar,
    /// Stored id(s) of another entity type.
    ForwardRef {
        /// The referenced entity type.
        target: EntityType,
        /// Whether the field holds an array of ids rather than a single id.
        array: bool,
    },
    /// Computed back-edge: discovered by querying `target` where `via`
    /// equals this entity's id. Never persisted.
    InverseRef {
        /// The entity type holding the forward reference.
        target: EntityType,
        /// The field on `target` that forward-references back to this type.
        via: &'static str,
        /// Whether all matches are assigned, or only the first.
        array: bool,
    },
}

/// One named field of an entity schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSchema {
    /// Document field name.
    pub name: &'static str,
    /// What the field holds.
    pub kind: FieldKind,
}

impl FieldSchema {
    /// A plain data field.
    pub const fn scalar(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Scalar,
        }
    }

    /// A single stored id referencing `target`.
    pub const fn forward(name: &'static str, target: EntityType) -> Self {
        Self {
            name,
            kind: FieldKind::ForwardRef {
                target,
                array: false,
            },
        }
    }

    /// An array of stored ids referencing `target`.
    pub const fn forward_array(name: &'static str, target: EntityType) -> Self {
        Self {
            name,
            kind: FieldKind::ForwardRef {
                target,
                array: true,
            },
        }
    }

    /// A computed back-edge assigned the single first match.
    pub const fn inverse(name: &'static str, target: EntityType, via: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::InverseRef {
                target,
                via,
                array: false,
            },
        }
    }

    /// A computed back-edge assigned the full match array.
    pub const fn inverse_array(name: &'static str, target: EntityType, via: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::InverseRef {
                target,
                via,
                array: true,
            },
        }
    }
}

/// Static schema for one entity type.
#[derive(Debug)]
pub struct EntitySchema {
    /// The type this schema describes.
    pub entity_type: EntityType,
    /// Declared fields. Fields absent here are treated as scalars.
    pub fields: &'static [FieldSchema],
}

impl EntitySchema {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// =============================================================================
// Entity Trait
// =============================================================================

/// A typed entity persisted through a [`DataStore`](crate::DataStore).
///
/// Entities must carry a string `id` field. `created_at` / `updated_at`
/// timestamps are stamped by the store at creation/update time if absent.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The static schema for this type.
    fn schema() -> &'static EntitySchema;

    /// The entity's id. Empty string means "not yet created".
    fn id(&self) -> &str;

    /// The entity-type token, from the schema.
    fn entity_type() -> EntityType {
        Self::schema().entity_type
    }
}

/// Convert a typed entity into its document form.
pub fn to_document<T: Entity>(entity: &T) -> Result<Document> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(LatticeError::Codec {
            entity_type: T::entity_type(),
            source: <serde_json::Error as serde::ser::Error>::custom(
                "entity did not serialize to a JSON object",
            ),
        }),
        Err(source) => Err(LatticeError::Codec {
            entity_type: T::entity_type(),
            source,
        }),
    }
}

/// Convert a document back into its typed form.
pub fn from_document<T: Entity>(doc: Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc)).map_err(|source| LatticeError::Codec {
        entity_type: T::entity_type(),
        source,
    })
}

/// Read the id field of a document, if present and a string.
pub(crate) fn document_id(doc: &Document) -> Option<&str> {
    doc.get(FIELD_ID).and_then(Value::as_str)
}

/// Drop computed inverse fields before a document is written anywhere.
pub(crate) fn strip_inverse_fields(schema: &EntitySchema, doc: &mut Document) {
    for field in schema.fields {
        if matches!(field.kind, FieldKind::InverseRef { .. }) {
            doc.remove(field.name);
        }
    }
}

// =============================================================================
// Ref
// =============================================================================

/// A forward reference: an id, or the loaded target after edge walking.
///
/// `Ref<T>` always serializes as the bare id - loaded state never persists.
/// It deserializes from either a string id or an embedded object, which is how
/// the edge walker hands loaded targets back through the typed boundary.
#[derive(Debug, Clone)]
pub enum Ref<T> {
    /// Unloaded: just the target's id.
    Id(String),
    /// Loaded by an edge walk.
    Loaded(Box<T>),
}

impl<T: Entity> Ref<T> {
    /// Create an unloaded reference.
    pub fn new(id: impl Into<String>) -> Self {
        Ref::Id(id.into())
    }

    /// The referenced id, loaded or not.
    pub fn id(&self) -> &str {
        match self {
            Ref::Id(id) => id,
            Ref::Loaded(entity) => entity.id(),
        }
    }

    /// The loaded target, if an edge walk resolved it.
    pub fn loaded(&self) -> Option<&T> {
        match self {
            Ref::Id(_) => None,
            Ref::Loaded(entity) => Some(entity),
        }
    }

    /// Consume into the loaded target, if any.
    pub fn into_loaded(self) -> Option<T> {
        match self {
            Ref::Id(_) => None,
            Ref::Loaded(entity) => Some(*entity),
        }
    }

    /// Whether the target has been loaded.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Ref::Loaded(_))
    }
}

impl<T: Entity> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<T: Entity> From<&str> for Ref<T> {
    fn from(id: &str) -> Self {
        Ref::Id(id.to_string())
    }
}

impl<T: Entity> From<String> for Ref<T> {
    fn from(id: String) -> Self {
        Ref::Id(id)
    }
}

impl<T: Entity> Serialize for Ref<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl<'de, T: Entity> Deserialize<'de> for Ref<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(id) => Ok(Ref::Id(id)),
            Value::Object(_) => serde_json::from_value::<T>(value)
                .map(|entity| Ref::Loaded(Box::new(entity)))
                .map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!(
                "expected id string or embedded {} object, got {}",
                T::entity_type(),
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Comment, Post, User, COMMENT, POST, USER};

    #[test]
    fn test_entity_type_tokens() {
        assert_eq!(USER.name(), "user");
        assert_eq!(USER, EntityType::new("user"));
        assert_ne!(USER, POST);
        assert_eq!(format!("{}", COMMENT), "comment");
    }

    #[test]
    fn test_schema_field_lookup() {
        let schema = Post::schema();
        assert!(matches!(
            schema.field("author").map(|f| f.kind),
            Some(FieldKind::ForwardRef { target, array: false }) if target == USER
        ));
        assert!(matches!(
            schema.field("comments").map(|f| f.kind),
            Some(FieldKind::InverseRef { target, via: "post", array: true }) if target == COMMENT
        ));
        assert!(schema.field("nope").is_none());
    }

    #[test]
    fn test_document_round_trip() {
        let user = User::fixture("user:1", "Ann");
        let doc = to_document(&user).unwrap();
        assert_eq!(document_id(&doc), Some("user:1"));

        let back: User = from_document(doc).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_strip_inverse_fields_removes_computed_edges() {
        let post = Post::fixture("post:1", "Hello", "user:1");
        let mut doc = to_document(&post).unwrap();
        doc.insert("comments".into(), serde_json::json!([{"id": "comment:1"}]));

        strip_inverse_fields(Post::schema(), &mut doc);
        assert!(!doc.contains_key("comments"));
        assert!(doc.contains_key("author"));
    }

    #[test]
    fn test_ref_serializes_as_bare_id() {
        let loaded: Ref<User> = Ref::Loaded(Box::new(User::fixture("user:7", "Bea")));
        assert_eq!(serde_json::to_value(&loaded).unwrap(), "user:7");

        let unloaded: Ref<User> = Ref::new("user:7");
        assert_eq!(serde_json::to_value(&unloaded).unwrap(), "user:7");
        assert_eq!(loaded, unloaded);
    }

    #[test]
    fn test_ref_deserializes_from_id_or_object() {
        let from_id: Ref<User> = serde_json::from_value(serde_json::json!("user:9")).unwrap();
        assert!(!from_id.is_loaded());
        assert_eq!(from_id.id(), "user:9");

        let from_object: Ref<User> =
            serde_json::from_value(serde_json::json!({"id": "user:9", "name": "Cal"})).unwrap();
        assert!(from_object.is_loaded());
        assert_eq!(from_object.loaded().unwrap().name, "Cal");

        let bad: std::result::Result<Ref<User>, _> =
            serde_json::from_value(serde_json::json!(42));
        assert!(bad.is_err());
    }

    #[test]
    fn test_comment_forward_ref_round_trip() {
        let comment = Comment::fixture("comment:1", "nice", "post:1");
        let doc = to_document(&comment).unwrap();
        assert_eq!(doc.get("post").unwrap(), "post:1");

        let back: Comment = from_document(doc).unwrap();
        assert_eq!(back.post.id(), "post:1");
    }
}
