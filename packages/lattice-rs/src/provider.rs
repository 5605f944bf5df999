//! Provider keys: opaque, typed, process-unique identifiers.
//!
//! A [`ProviderKey<T>`] is minted once (typically at startup, held in a
//! `static`) and then used to register and resolve values through a
//! [`Scope`](crate::Scope) tree. Equality is identity-based: no two distinct
//! keys are ever equal, even with the same debug name. Keys are never
//! destroyed; they live for the process.
//!
//! Registration is always an explicit call on a scope - there is no hidden
//! metadata attached to provider functions and no global registry.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::LazyLock;
//!
//! static PAGE_SIZE: LazyLock<ProviderKey<usize>> =
//!     LazyLock::new(|| ProviderKey::with_default("app.page_size", 25));
//!
//! let scope = Scope::root("app");
//! assert_eq!(scope.resolve(&PAGE_SIZE)?, 25); // default, nothing registered
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide key id counter. Identity equality comes from this, never
/// from the debug name.
static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque typed identifier used to look up a value through scope resolution.
pub struct ProviderKey<T> {
    id: u64,
    name: &'static str,
    default: Option<Arc<dyn Fn() -> T + Send + Sync>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ProviderKey<T> {
    /// Mint a key with no default. Resolution fails if nothing is registered.
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            default: None,
            _marker: PhantomData,
        }
    }

    /// Mint a key whose resolution falls back to a constant.
    pub fn with_default(name: &'static str, value: T) -> Self
    where
        T: Clone,
    {
        Self::with_default_producer(name, move || value.clone())
    }

    /// Mint a key whose resolution falls back to a producer function.
    pub fn with_default_producer(
        name: &'static str,
        producer: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            default: Some(Arc::new(producer)),
            _marker: PhantomData,
        }
    }

    /// Debug name, used in error messages. Not part of identity.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn default_value(&self) -> Option<T> {
        self.default.as_ref().map(|producer| producer())
    }
}

impl<T> PartialEq for ProviderKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ProviderKey<T> {}

impl<T> std::hash::Hash for ProviderKey<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for ProviderKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}
