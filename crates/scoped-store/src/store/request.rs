use super::attribute::AttributeBeanStore;
use crate::backend::{AttributeBacking, AttributeValue, KeyValueBackend};
use crate::error::BackendError;
use crate::host::RequestHost;
use crate::naming::NamingScheme;
use std::fmt;
use std::sync::Arc;

/// Request attribute backend
///
/// A request never outlives its own thread, so stores over it can neither
/// detach nor need creation locks.
#[derive(Clone)]
pub struct RequestAttributes {
    request: Arc<dyn RequestHost>,
}

impl RequestAttributes {
    /// Wrap a request host
    #[inline]
    #[must_use]
    pub fn new(request: Arc<dyn RequestHost>) -> Self {
        Self { request }
    }
}

impl fmt::Debug for RequestAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAttributes").finish_non_exhaustive()
    }
}

impl KeyValueBackend for RequestAttributes {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        self.request.get(key)
    }

    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        self.request.put(key, value)
    }

    fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.request.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.request.keys()
    }
}

impl AttributeBacking for RequestAttributes {
    const DETACHABLE: bool = false;
}

/// Bean store over request attributes
pub type RequestBeanStore = AttributeBeanStore<RequestAttributes>;

impl AttributeBeanStore<RequestAttributes> {
    /// Create request bean store
    #[must_use]
    pub fn new(scheme: NamingScheme, request: Arc<dyn RequestHost>) -> Self {
        Self::with_backend(scheme, RequestAttributes::new(request))
    }
}
