//! Request-scoped instance cache
//!
//! Remembers instances looked up during one request so repeated lookups skip
//! the bean store. The cache only holds entries between
//! [`RequestScopedCache::begin_request`] and
//! [`RequestScopedCache::end_request`]; each window is a new generation and
//! nothing survives from one generation into the next.

use parking_lot::Mutex;
use scoped_store::ContextualInstance;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct CacheState {
    generation: u64,
    active: bool,
    entries: HashMap<String, ContextualInstance>,
}

/// Per-worker cache bounded by request activation
#[derive(Debug, Default)]
pub struct RequestScopedCache {
    state: Mutex<CacheState>,
}

impl RequestScopedCache {
    /// Create inactive cache
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation
    pub fn begin_request(&self) {
        let mut state = self.state.lock();
        if state.active {
            tracing::warn!(
                generation = state.generation,
                "request cache was not ended by the previous request"
            );
        }
        state.entries.clear();
        state.active = true;
        state.generation += 1;
    }

    /// End the current generation, dropping every entry
    pub fn end_request(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.active = false;
    }

    /// Cached instance, if the generation is open and the instance is live
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ContextualInstance> {
        let state = self.state.lock();
        if !state.active {
            return None;
        }
        state
            .entries
            .get(key)
            .filter(|instance| !instance.is_destroyed())
            .cloned()
    }

    /// Cache an instance if a generation is open
    pub fn insert_if_active(&self, key: impl Into<String>, instance: ContextualInstance) -> bool {
        let mut state = self.state.lock();
        if !state.active {
            return false;
        }
        state.entries.insert(key.into(), instance);
        true
    }

    /// Drop every entry of the current generation
    pub fn invalidate(&self) {
        self.state.lock().entries.clear();
    }

    /// Whether a generation is open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Number of generations started so far
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_test_utils::{instance_of, RecordingContextual};

    #[test]
    fn entries_never_cross_generations() {
        let cache = RequestScopedCache::new();
        let bean = RecordingContextual::new("shop.Cart");

        assert!(!cache.insert_if_active("k", instance_of(&bean)));

        cache.begin_request();
        assert!(cache.insert_if_active("k", instance_of(&bean)));
        assert!(cache.get("k").is_some());
        cache.end_request();

        cache.begin_request();
        assert!(cache.get("k").is_none());
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn destroyed_instances_are_not_served() {
        let cache = RequestScopedCache::new();
        let bean = RecordingContextual::new("shop.Cart");
        let instance = instance_of(&bean);

        cache.begin_request();
        cache.insert_if_active("k", instance.clone());
        instance.destroy().unwrap();
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn invalidate_keeps_generation_open() {
        let cache = RequestScopedCache::new();
        let bean = RecordingContextual::new("shop.Cart");
        cache.begin_request();
        cache.insert_if_active("k", instance_of(&bean));
        cache.invalidate();
        assert!(cache.get("k").is_none());
        assert!(cache.is_active());
    }
}
