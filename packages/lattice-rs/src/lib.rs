//! # Lattice
//!
//! Scoped dependency provision and cached, relationship-aware data access
//! for application frontends.
//!
//! Three layers, loosely coupled:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Scope tree                                             │
//! │  ProviderKey<T> ── provide / resolve ── parent fallback │
//! └────────────────────────────┬────────────────────────────┘
//!                              │ provides
//! ┌────────────────────────────▼────────────────────────────┐
//! │  StoreFactory ── DataStore<T> per entity type           │
//! │  get / create / update / remove / query / listen        │
//! └──────────────┬─────────────────────────┬────────────────┘
//!                │ caches through          │ walks edges via
//! ┌──────────────▼──────────────┐  ┌───────▼────────────────┐
//! │  EntityCache                │  │  EntitySchema          │
//! │  MemoryCache / Passthrough  │  │  EdgeSelector claims   │
//! └──────────────┬──────────────┘  └────────────────────────┘
//!                │ falls back to
//! ┌──────────────▼──────────────────────────────────────────┐
//! │  Backend (document database, HTTP API, test in-memory)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key invariants
//!
//! - **Identity-keyed provision**: a [`ProviderKey`] is equal only to itself.
//!   Resolution walks the scope tree child-first, then falls back to the
//!   key's default, and fails loudly otherwise.
//! - **Silent warm-up**: cache population from backend reads (`load`) never
//!   notifies listeners; only `add`, materially-changed `update`, and
//!   `remove` of an existing entry do. Notification is queued, never
//!   recursive.
//! - **Static edges**: relationships are declared in `&'static`
//!   [`EntitySchema`]s, and edge walks follow only the selectors the caller
//!   passes. Bounded selectors share their depth budget across every branch
//!   of one load.
//! - **Unrolled optimism**: optimistic writes announce to the cache before
//!   the backend confirms, and a backend failure does not roll them back.
//!
//! ## Example
//!
//! ```ignore
//! use lattice::{
//!     EdgeSelector, GetOptions, ProviderKey, Scope, StoreFactory, WriteOptions,
//! };
//!
//! let factory = StoreFactory::new("prod", backend);
//! factory.store::<User>();
//! factory.store::<Post>();
//! factory.store::<Comment>();
//!
//! let app = Scope::root("app");
//! app.provide_value(&STORE_FACTORY, factory);
//!
//! // Somewhere down the tree:
//! let posts = scope.resolve(&STORE_FACTORY)?.store::<Post>();
//! let post = posts
//!     .required(
//!         "post:1",
//!         GetOptions::default().edges(vec![EdgeSelector::all(COMMENT)]),
//!     )
//!     .await?;
//! ```

mod backend;
mod cache;
mod edges;
mod entity;
mod error;
mod factory;
mod provider;
mod query;
mod reload;
mod scope;
mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Provision
pub use provider::ProviderKey;
pub use reload::ReloadSignal;
pub use scope::{Scope, Subscription};

// Entities and schemas
pub use entity::{
    from_document, to_document, Document, Entity, EntitySchema, EntityType, FieldKind,
    FieldSchema, Ref, FIELD_CREATED_AT, FIELD_ID, FIELD_UPDATED_AT,
};

// Queries
pub use query::{Filter, FilterOp, OrderBy, Query, SortDirection};

// Caching
pub use cache::{
    CacheOp, ChangeEvent, ChangeListener, DocLoader, DocsLoader, EntityCache, MemoryCache,
    PassthroughCache, WILDCARD_ID,
};

// Stores
pub use backend::Backend;
pub use edges::EdgeSelector;
pub use factory::{CacheMode, StoreFactory};
pub use store::{CachePolicy, DataStore, GetOptions, WriteOptions};

// Errors
pub use error::{LatticeError, Result};

// Implementors of [`Backend`] need the same macro.
pub use async_trait::async_trait;
