use super::{BoundContext, ScopeType};
use crate::cache::RequestScopedCache;
use scoped_store::{BoundBeanStore, NamingScheme, RequestBeanStore, RequestHost};
use std::sync::Arc;

/// Request context over request attributes
pub type RequestContext = BoundContext<Arc<dyn RequestHost>>;

/// Build the request context
///
/// The request context opens and closes the cache generation, so every
/// request starts with an empty cache.
#[must_use]
pub fn request_context(context_id: &str, cache: Arc<RequestScopedCache>) -> RequestContext {
    let scheme = NamingScheme::new(ScopeType::Request.as_str(), context_id);
    BoundContext::new(ScopeType::Request, move |request: &Arc<dyn RequestHost>| {
        Box::new(RequestBeanStore::new(scheme.clone(), Arc::clone(request))) as Box<dyn BoundBeanStore>
    })
    .with_cache(cache)
    .owning_cache_generation()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use scoped_store::{Contextual, KeyValueBackend, MemoryRequest};
    use scoped_test_utils::RecordingContextual;

    #[test]
    fn cache_generation_follows_activation() {
        let cache = Arc::new(RequestScopedCache::new());
        let mut ctx = request_context("main", Arc::clone(&cache));
        let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());

        ctx.associate(&request);
        ctx.activate();
        assert!(cache.is_active());

        let bean: Arc<dyn Contextual> = RecordingContextual::new("a");
        let instance = ctx.get_or_create(&bean).unwrap();
        assert!(cache.get("request#a").unwrap().ptr_eq(&instance));

        ctx.deactivate();
        assert!(!cache.is_active());
        assert!(cache.get("request#a").is_none());
    }

    #[test]
    fn instances_live_in_request_attributes() {
        let cache = Arc::new(RequestScopedCache::new());
        let mut ctx = request_context("main", cache);
        let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());

        ctx.associate(&request);
        ctx.activate();
        let bean: Arc<dyn Contextual> = RecordingContextual::new("a");
        ctx.get_or_create(&bean).unwrap();

        assert_eq!(request.keys(), vec!["request#main#a".to_string()]);
    }
}
