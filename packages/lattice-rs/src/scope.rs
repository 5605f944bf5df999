//! Hierarchical resolution scopes with parent fallback.
//!
//! A [`Scope`] is one node in a tree of resolution contexts - typically one
//! root scope per application and one child scope per screen or subtree.
//! Resolution checks the local scope first, then walks up the parent chain,
//! then falls back to the key's default; only if none of those exist does it
//! fail. Child registrations therefore override parent registrations.
//!
//! Children hold a reference to their parent; parents do not track children.
//! Dropping a subtree's scope drops its registrations with it.
//!
//! # Reactivity
//!
//! [`Scope::provide_value`] is the sole mechanism by which reactive updates
//! propagate: it registers the constant and synchronously notifies every
//! listener registered for that key *in that scope*. UI-facing consumers are
//! expected to defer their own re-render scheduling to the next tick rather
//! than mutating state inside the callback.
//!
//! # Example
//!
//! ```ignore
//! let app = Scope::root("app");
//! let screen = app.child("settings");
//!
//! app.provide_value(&PAGE_SIZE, 25);
//! screen.provide_value(&PAGE_SIZE, 100);
//!
//! assert_eq!(app.resolve(&PAGE_SIZE)?, 25);
//! assert_eq!(screen.resolve(&PAGE_SIZE)?, 100); // override wins
//! ```

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, error, trace};

use crate::error::{LatticeError, Result};
use crate::provider::ProviderKey;

type ErasedProvider = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;
type ErasedListener = Arc<dyn Fn(&dyn Any) + Send + Sync>;

// =============================================================================
// Subscription
// =============================================================================

/// Handle for exactly one listener registration.
///
/// Calling [`Subscription::unsubscribe`] removes that registration and no
/// other - registering the same callback twice yields two independent
/// handles. Dropping the handle without calling `unsubscribe` leaves the
/// listener registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that was never registered anywhere (pass-through cache).
    pub(crate) fn inert() -> Self {
        Self { cancel: None }
    }

    /// Remove this registration.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// =============================================================================
// Scope
// =============================================================================

/// A node in the resolution tree: providers, listeners, and a parent.
pub struct Scope {
    name: &'static str,
    // Self-handle so `child` can capture this scope as a parent from `&self`.
    me: Weak<Scope>,
    parent: Option<Arc<Scope>>,
    providers: DashMap<u64, ErasedProvider>,
    listeners: Arc<DashMap<u64, Vec<(u64, ErasedListener)>>>,
    next_handle: AtomicU64,
}

impl Scope {
    fn build(name: &'static str, parent: Option<Arc<Scope>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name,
            me: me.clone(),
            parent,
            providers: DashMap::new(),
            listeners: Arc::new(DashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Create a root scope with no parent.
    pub fn root(name: &'static str) -> Arc<Self> {
        Self::build(name, None)
    }

    /// Create a child scope. The child checks itself before delegating here.
    pub fn child(&self, name: &'static str) -> Arc<Self> {
        Self::build(name, self.me.upgrade())
    }

    /// Debug name of this scope.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a provider function for a key.
    ///
    /// The function is lazy and re-invoked on every [`Scope::resolve`] - the
    /// scope itself memoizes nothing.
    pub fn provide<T: Send + Sync + 'static>(
        &self,
        key: &ProviderKey<T>,
        provider: impl Fn() -> T + Send + Sync + 'static,
    ) {
        debug!(key = key.name(), scope = self.name, "provider registered");
        self.providers.insert(
            key.id(),
            Arc::new(move || Box::new(provider()) as Box<dyn Any + Send>),
        );
    }

    /// Register a constant for a key and notify this scope's listeners.
    pub fn provide_value<T: Clone + Send + Sync + 'static>(&self, key: &ProviderKey<T>, value: T) {
        let registered = value.clone();
        self.providers.insert(
            key.id(),
            Arc::new(move || Box::new(registered.clone()) as Box<dyn Any + Send>),
        );
        debug!(key = key.name(), scope = self.name, "value provided");

        // Snapshot outside the map guard; a listener may register or
        // unregister other listeners from inside its callback.
        let snapshot: Vec<ErasedListener> = self
            .listeners
            .get(&key.id())
            .map(|entry| entry.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for listener in snapshot {
            listener(&value);
        }
    }

    /// Resolve a key: this scope, then ancestors, then the key's default.
    pub fn resolve<T: Send + Sync + 'static>(&self, key: &ProviderKey<T>) -> Result<T> {
        let mut current = Some(self);
        while let Some(scope) = current {
            let provider = scope
                .providers
                .get(&key.id())
                .map(|entry| Arc::clone(entry.value()));
            if let Some(provider) = provider {
                trace!(key = key.name(), scope = scope.name, "key resolved");
                match provider().downcast::<T>() {
                    Ok(value) => return Ok(*value),
                    Err(_) => {
                        // Unreachable when keys are minted normally: ids are
                        // process-unique and registration is typed.
                        error!(
                            key = key.name(),
                            scope = scope.name,
                            "provider produced a value of the wrong type"
                        );
                    }
                }
            }
            current = scope.parent.as_deref();
        }

        if let Some(value) = key.default_value() {
            trace!(key = key.name(), "key resolved from default");
            return Ok(value);
        }

        Err(LatticeError::UnregisteredKey { key: key.name() })
    }

    /// Register a listener invoked on every [`Scope::provide_value`] for this
    /// key in this scope. Returns a handle that removes exactly this
    /// registration.
    pub fn listen<T: Send + Sync + 'static>(
        &self,
        key: &ProviderKey<T>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let erased: ErasedListener = Arc::new(move |value: &dyn Any| {
            if let Some(typed) = value.downcast_ref::<T>() {
                callback(typed);
            }
        });
        self.listeners
            .entry(key.id())
            .or_default()
            .push((handle, erased));

        let listeners = Arc::clone(&self.listeners);
        let key_id = key.id();
        Subscription::new(move || {
            if let Some(mut entry) = listeners.get_mut(&key_id) {
                entry.retain(|(h, _)| *h != handle);
            }
            listeners.remove_if(&key_id, |_, registrations| registrations.is_empty());
        })
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("providers", &self.providers.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
