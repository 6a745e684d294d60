use super::{cached_get_or_create, destroy_all, run_destruction, Context, ScopeType};
use crate::cache::RequestScopedCache;
use crate::error::{ContextError, Result};
use scoped_store::{BeanIdentifier, BoundBeanStore, Contextual, ContextualInstance};
use std::fmt;
use std::sync::Arc;

/// Builds a fresh bean store for a unit of work
pub type StoreFactory<U> = Box<dyn Fn(&U) -> Box<dyn BoundBeanStore> + Send>;

/// Context bound to one unit of work at a time
///
/// `UNASSOCIATED -> ASSOCIATED(store) -> {ACTIVE, INACTIVE} -> UNASSOCIATED`.
///
/// Association always installs a freshly built store. Finding a store
/// already in place means the previous unit of work never dissociated; that
/// is logged and the stale store is dropped.
pub struct BoundContext<U> {
    scope: ScopeType,
    factory: StoreFactory<U>,
    store: Option<Box<dyn BoundBeanStore>>,
    active: bool,
    valid: bool,
    multithreaded: bool,
    cache: Option<Arc<RequestScopedCache>>,
    owns_cache_generation: bool,
}

impl<U> BoundContext<U> {
    /// Create unassociated context
    pub fn new<F>(scope: ScopeType, factory: F) -> Self
    where
        F: Fn(&U) -> Box<dyn BoundBeanStore> + Send + 'static,
    {
        Self {
            scope,
            factory: Box::new(factory),
            store: None,
            active: false,
            valid: true,
            multithreaded: false,
            cache: None,
            owns_cache_generation: false,
        }
    }

    /// Serialize instance creation per bean through the store's lock
    #[must_use]
    pub fn multithreaded(mut self) -> Self {
        self.multithreaded = true;
        self
    }

    /// Route lookups through a request cache
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<RequestScopedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Begin and end the cache generation on activate/deactivate
    #[must_use]
    pub fn owning_cache_generation(mut self) -> Self {
        self.owns_cache_generation = true;
        self
    }

    /// Bind a fresh store for `unit`
    ///
    /// Returns `false` when a leaked store had to be replaced.
    pub fn associate(&mut self, unit: &U) -> bool {
        let leaked = self.store.take().is_some();
        if leaked {
            tracing::warn!(
                scope = %self.scope,
                "bean store leak during association, previous store was not dissociated"
            );
        }
        let mut store = (self.factory)(unit);
        store.attach();
        self.store = Some(store);
        self.valid = true;
        !leaked
    }

    /// Detach and drop the store
    pub fn dissociate(&mut self) -> bool {
        match self.store.take() {
            Some(mut store) => {
                store.detach();
                true
            }
            None => false,
        }
    }

    /// Whether a store is bound
    #[inline]
    #[must_use]
    pub fn is_associated(&self) -> bool {
        self.store.is_some()
    }

    /// Allow get/create
    pub fn activate(&mut self) {
        if self.active {
            tracing::warn!(scope = %self.scope, "context already active");
        }
        self.active = true;
        if self.owns_cache_generation {
            if let Some(cache) = &self.cache {
                cache.begin_request();
            }
        }
    }

    /// Disallow get/create, destroying everything first if invalidated
    pub fn deactivate(&mut self) {
        if !self.valid {
            if let Some(store) = self.store.as_deref_mut() {
                let destroyed = destroy_all(store);
                tracing::debug!(scope = %self.scope, destroyed, "invalidated context destroyed");
            }
            if let Some(cache) = &self.cache {
                cache.invalidate();
            }
            self.valid = true;
        }
        if self.owns_cache_generation {
            if let Some(cache) = &self.cache {
                cache.end_request();
            }
        }
        self.active = false;
    }

    /// Mark the context so the next deactivation destroys its instances
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Whether the context has not been invalidated
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Destroy every instance, then dissociate
    ///
    /// No-op when nothing is associated. Returns the number of destruction
    /// callbacks that completed.
    pub fn destroy(&mut self) -> usize {
        let Some(store) = self.store.as_deref_mut() else {
            return 0;
        };
        let destroyed = destroy_all(store);
        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
        tracing::debug!(scope = %self.scope, destroyed, "context destroyed");
        self.dissociate();
        destroyed
    }

    /// Identifiers in the bound store
    #[must_use]
    pub fn ids(&self) -> Vec<BeanIdentifier> {
        self.store
            .as_deref()
            .map(|store| store.keys().collect())
            .unwrap_or_default()
    }
}

impl<U> Context for BoundContext<U> {
    fn scope(&self) -> ScopeType {
        self.scope
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn get(&mut self, id: &BeanIdentifier) -> Result<Option<ContextualInstance>> {
        if !self.active {
            return Err(ContextError::NotActive(self.scope));
        }
        Ok(self.store.as_deref_mut().and_then(|store| store.get(id)))
    }

    fn get_or_create(&mut self, contextual: &Arc<dyn Contextual>) -> Result<ContextualInstance> {
        if !self.active {
            return Err(ContextError::NotActive(self.scope));
        }
        let store = self
            .store
            .as_deref_mut()
            .ok_or(ContextError::NoBeanStore(self.scope))?;
        cached_get_or_create(
            self.cache.as_deref(),
            self.scope,
            store,
            contextual,
            self.multithreaded,
        )
    }

    fn destroy_instance(&mut self, id: &BeanIdentifier) -> Result<bool> {
        if !self.active {
            return Err(ContextError::NotActive(self.scope));
        }
        let Some(instance) = self.store.as_deref_mut().and_then(|store| store.remove(id)) else {
            return Ok(false);
        };
        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
        Ok(run_destruction(&instance))
    }
}

impl<U> fmt::Debug for BoundContext<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundContext")
            .field("scope", &self.scope)
            .field("associated", &self.store.is_some())
            .field("active", &self.active)
            .field("valid", &self.valid)
            .field("multithreaded", &self.multithreaded)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_store::{MemoryRequest, NamingScheme, RequestBeanStore, RequestHost};
    use scoped_test_utils::RecordingContextual;

    fn context() -> BoundContext<Arc<dyn RequestHost>> {
        BoundContext::new(ScopeType::Request, |request: &Arc<dyn RequestHost>| {
            Box::new(RequestBeanStore::new(
                NamingScheme::new("request", "test"),
                Arc::clone(request),
            )) as Box<dyn BoundBeanStore>
        })
    }

    fn request() -> Arc<dyn RequestHost> {
        Arc::new(MemoryRequest::new())
    }

    #[test]
    fn inactive_context_refuses_access() {
        let mut ctx = context();
        ctx.associate(&request());
        let bean: Arc<dyn Contextual> = RecordingContextual::new("a");
        let err = ctx.get_or_create(&bean).unwrap_err();
        assert!(err.is_not_active());
        assert!(ctx.get(&BeanIdentifier::new("a")).unwrap_err().is_not_active());
    }

    #[test]
    fn active_without_store_reports_missing_store() {
        let mut ctx = context();
        ctx.activate();
        let bean: Arc<dyn Contextual> = RecordingContextual::new("a");
        assert!(matches!(
            ctx.get_or_create(&bean),
            Err(ContextError::NoBeanStore(ScopeType::Request))
        ));
        assert!(ctx.get(&BeanIdentifier::new("a")).unwrap().is_none());
    }

    #[test]
    fn get_or_create_creates_once() {
        let recording = RecordingContextual::new("a");
        let bean: Arc<dyn Contextual> = recording.clone();
        let mut ctx = context();
        ctx.associate(&request());
        ctx.activate();

        let first = ctx.get_or_create(&bean).unwrap();
        let second = ctx.get_or_create(&bean).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(recording.created(), 1);
    }

    #[test]
    fn double_association_replaces_store() {
        let recording = RecordingContextual::new("a");
        let bean: Arc<dyn Contextual> = recording.clone();
        let mut ctx = context();
        assert!(ctx.associate(&request()));
        ctx.activate();
        ctx.get_or_create(&bean).unwrap();

        assert!(!ctx.associate(&request()));
        assert!(ctx.get(recording.id()).unwrap().is_none());
    }

    #[test]
    fn destroy_without_association_is_noop() {
        let mut ctx = context();
        assert_eq!(ctx.destroy(), 0);
        assert!(!ctx.dissociate());
    }

    #[test]
    fn invalidated_context_destroys_on_deactivate() {
        let recording = RecordingContextual::new("a");
        let bean: Arc<dyn Contextual> = recording.clone();
        let mut ctx = context();
        ctx.associate(&request());
        ctx.activate();
        ctx.get_or_create(&bean).unwrap();

        ctx.invalidate();
        ctx.deactivate();
        assert_eq!(recording.destroyed(), 1);
        assert!(ctx.is_valid());
        assert!(!ctx.is_active());
    }

    #[test]
    fn destroy_continues_past_failing_callbacks() {
        let failing = RecordingContextual::failing("a");
        let panicking = RecordingContextual::panicking("b");
        let healthy = RecordingContextual::new("c");
        let mut ctx = context();
        ctx.associate(&request());
        ctx.activate();
        for bean in [failing.clone(), panicking.clone(), healthy.clone()] {
            let bean: Arc<dyn Contextual> = bean;
            ctx.get_or_create(&bean).unwrap();
        }

        assert_eq!(ctx.destroy(), 1);
        assert_eq!(failing.destroyed(), 1);
        assert_eq!(panicking.destroyed(), 1);
        assert_eq!(healthy.destroyed(), 1);
        assert!(!ctx.is_associated());
    }

    #[test]
    fn destroy_instance_removes_single_bean() {
        let recording = RecordingContextual::new("a");
        let bean: Arc<dyn Contextual> = recording.clone();
        let mut ctx = context();
        ctx.associate(&request());
        ctx.activate();
        ctx.get_or_create(&bean).unwrap();

        assert!(ctx.destroy_instance(recording.id()).unwrap());
        assert!(!ctx.destroy_instance(recording.id()).unwrap());
        assert_eq!(recording.destroyed(), 1);
    }
}
