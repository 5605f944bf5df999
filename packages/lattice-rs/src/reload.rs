//! Reload signal: a scoped generation counter for forced cache bypass.
//!
//! Not itself a cache. A [`ReloadSignal`] is a monotonically increasing
//! counter propagated by value through the scope tree; any computation keyed
//! by `(entity, generation)` is invalidated when the generation changes.
//! Incrementing it is the documented way to force dependents to bypass
//! memoized load results.
//!
//! Clones share the counter, so a signal provided at an application scope and
//! resolved in a screen scope observes the same generation. Providing a fresh
//! signal in a child scope gives that subtree its own, independently
//! incrementing generation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A shared, monotonically increasing generation token.
#[derive(Clone, Default)]
pub struct ReloadSignal {
    generation: Arc<AtomicU64>,
}

impl ReloadSignal {
    /// Create a signal at generation zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Increment the generation, invalidating anything keyed by the previous
    /// one. Returns the new generation.
    pub fn reload(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl fmt::Debug for ReloadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadSignal")
            .field("generation", &self.generation())
            .finish()
    }
}
