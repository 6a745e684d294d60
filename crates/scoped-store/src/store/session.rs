//! Session-backed stores
//!
//! Three backends over the same session attribute bag:
//!
//! - [`SessionAttributes`] holds a session that already exists
//! - [`LazySessionBackend`] asks the request for its session on every call
//!   and only creates one when something is written
//! - [`LazyCyclicSessionBackend`] additionally stages writes made while the
//!   session is being created, see [`StagingScope`]

use super::attribute::{from_attribute, to_attribute, AttributeBeanStore};
use crate::backend::{AttributeBacking, AttributeValue, KeyValueBackend};
use crate::error::{BackendError, HostError};
use crate::host::{RequestHost, SessionHost};
use crate::identifier::BeanIdentifier;
use crate::instance::ContextualInstance;
use crate::lock::LockStore;
use crate::naming::NamingScheme;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Backend over an existing session
#[derive(Clone)]
pub struct SessionAttributes {
    session: Arc<dyn SessionHost>,
}

impl SessionAttributes {
    /// Wrap a session host
    #[inline]
    #[must_use]
    pub fn new(session: Arc<dyn SessionHost>) -> Self {
        Self { session }
    }

    /// The wrapped session
    #[inline]
    #[must_use]
    pub fn session(&self) -> &Arc<dyn SessionHost> {
        &self.session
    }
}

impl fmt::Debug for SessionAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAttributes")
            .field("session", &self.session.id())
            .finish()
    }
}

impl KeyValueBackend for SessionAttributes {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        self.session.get(key)
    }

    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        self.session.put(key, value)
    }

    fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.session.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.session.keys()
    }
}

impl AttributeBacking for SessionAttributes {
    fn lock_store(&self) -> Option<Arc<LockStore>> {
        LockStore::for_session(self.session.as_ref())
    }
}

/// Backend that fetches the request's session on demand
///
/// Reads never create a session. A write creates one; if the container
/// refuses, the write fails with [`BackendError::Unavailable`].
#[derive(Clone)]
pub struct LazySessionBackend {
    request: Arc<dyn RequestHost>,
}

impl LazySessionBackend {
    /// Wrap a request host
    #[inline]
    #[must_use]
    pub fn new(request: Arc<dyn RequestHost>) -> Self {
        Self { request }
    }

    /// Session of the request, if one exists
    #[must_use]
    pub fn existing_session(&self) -> Option<Arc<dyn SessionHost>> {
        match self.request.session(false) {
            Ok(session) => session,
            Err(err) => {
                tracing::trace!(%err, "session lookup failed");
                None
            }
        }
    }

    /// Session of the request, created if needed
    ///
    /// # Errors
    /// Returns [`HostError::SessionCreationRefused`] if the container can
    /// no longer create a session.
    pub fn session_or_create(&self) -> Result<Arc<dyn SessionHost>, HostError> {
        self.request.session(true)?.ok_or_else(|| {
            HostError::SessionCreationRefused("container returned no session".to_string())
        })
    }
}

impl fmt::Debug for LazySessionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySessionBackend").finish_non_exhaustive()
    }
}

impl KeyValueBackend for LazySessionBackend {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        self.existing_session()?.get(key)
    }

    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        self.session_or_create()?.put(key, value)
    }

    fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.existing_session()?.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.existing_session()
            .map(|session| session.keys())
            .unwrap_or_default()
    }
}

impl AttributeBacking for LazySessionBackend {
    fn lock_store(&self) -> Option<Arc<LockStore>> {
        LockStore::for_session(self.existing_session()?.as_ref())
    }
}

/// Write buffer for the window in which a session is being created
///
/// Lives on the stack of the write that triggers session creation and is
/// handed to the [`SessionCreationListener`]. Everything staged is flushed
/// into the new session before that write returns; nothing staged is ever
/// visible to another call.
pub struct StagingScope<'a> {
    scheme: &'a NamingScheme,
    entries: BTreeMap<String, AttributeValue>,
}

impl<'a> StagingScope<'a> {
    fn new(scheme: &'a NamingScheme) -> Self {
        Self {
            scheme,
            entries: BTreeMap::new(),
        }
    }

    fn stage(&mut self, key: &str, value: AttributeValue) {
        self.entries.insert(key.to_string(), value);
    }

    /// Stage an instance for the store being written
    pub fn put(&mut self, id: &BeanIdentifier, instance: &ContextualInstance) {
        let key = self.scheme.prefix(id);
        tracing::trace!(key = %key, "staged during session creation");
        self.entries.insert(key, to_attribute(instance));
    }

    /// Read a staged instance
    #[must_use]
    pub fn get(&self, id: &BeanIdentifier) -> Option<ContextualInstance> {
        self.entries
            .get(&self.scheme.prefix(id))
            .cloned()
            .and_then(from_attribute)
    }

    /// Number of staged entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn flush(self, session: &dyn SessionHost) -> Result<(), BackendError> {
        for (key, value) in self.entries {
            session.put(&key, value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for StagingScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingScope")
            .field("scheme", self.scheme)
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Callback run when a lazy cyclic store creates the session
///
/// Code that reacts to session creation by creating more session-scoped
/// instances writes them through the staging scope; they land in the session
/// together with the write that created it.
pub trait SessionCreationListener: Send + Sync {
    /// A session was just created by a store write
    fn session_created(&self, session: &dyn SessionHost, staging: &mut StagingScope<'_>);
}

/// Lazy session backend that tolerates re-entrant writes
#[derive(Clone)]
pub struct LazyCyclicSessionBackend {
    lazy: LazySessionBackend,
    scheme: NamingScheme,
    listener: Option<Arc<dyn SessionCreationListener>>,
}

impl LazyCyclicSessionBackend {
    /// Create backend for a store using `scheme`
    #[must_use]
    pub fn new(
        request: Arc<dyn RequestHost>,
        scheme: NamingScheme,
        listener: Option<Arc<dyn SessionCreationListener>>,
    ) -> Self {
        Self {
            lazy: LazySessionBackend::new(request),
            scheme,
            listener,
        }
    }

    fn create_and_flush(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        let mut staging = StagingScope::new(&self.scheme);
        staging.stage(key, value);
        let session = self.lazy.session_or_create()?;
        if let Some(listener) = &self.listener {
            listener.session_created(session.as_ref(), &mut staging);
        }
        tracing::debug!(
            session = session.id(),
            staged = staging.len(),
            "session created by bean store write"
        );
        staging.flush(session.as_ref())
    }
}

impl fmt::Debug for LazyCyclicSessionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCyclicSessionBackend")
            .field("scheme", &self.scheme)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl KeyValueBackend for LazyCyclicSessionBackend {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        self.lazy.get(key)
    }

    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        match self.lazy.existing_session() {
            Some(session) => session.put(key, value),
            None => self.create_and_flush(key, value),
        }
    }

    fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.lazy.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.lazy.keys()
    }
}

impl AttributeBacking for LazyCyclicSessionBackend {
    fn lock_store(&self) -> Option<Arc<LockStore>> {
        self.lazy.lock_store()
    }
}

/// Bean store over a session that already exists
pub type EagerSessionBeanStore = AttributeBeanStore<SessionAttributes>;

/// Bean store that creates the session on first write
pub type LazySessionBeanStore = AttributeBeanStore<LazySessionBackend>;

/// Lazy session bean store with staged session-creation writes
pub type LazyCyclicSessionBeanStore = AttributeBeanStore<LazyCyclicSessionBackend>;

impl AttributeBeanStore<SessionAttributes> {
    /// Create store over an existing session
    #[must_use]
    pub fn new(scheme: NamingScheme, session: Arc<dyn SessionHost>) -> Self {
        Self::with_backend(scheme, SessionAttributes::new(session))
    }
}

impl AttributeBeanStore<LazySessionBackend> {
    /// Create store over the request's session, created on demand
    #[must_use]
    pub fn new(scheme: NamingScheme, request: Arc<dyn RequestHost>) -> Self {
        Self::with_backend(scheme, LazySessionBackend::new(request))
    }
}

impl AttributeBeanStore<LazyCyclicSessionBackend> {
    /// Create cyclic store over the request's session
    #[must_use]
    pub fn new(
        scheme: NamingScheme,
        request: Arc<dyn RequestHost>,
        listener: Option<Arc<dyn SessionCreationListener>>,
    ) -> Self {
        let backend = LazyCyclicSessionBackend::new(request, scheme.clone(), listener);
        Self::with_backend(scheme, backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRequest, MemorySession};
    use crate::store::{BeanStore, BoundBeanStore};

    #[test]
    fn eager_store_locks_through_session_lock_store() {
        let session = MemorySession::new();
        let scheme = NamingScheme::new("session", "s");
        let mut store = EagerSessionBeanStore::new(scheme, session.clone());
        assert!(store.attach());

        let id = BeanIdentifier::new("shop.Cart");
        let held = store.lock(&id).unwrap();
        let locks = LockStore::existing(session.as_ref()).unwrap();
        assert!(locks.is_locked(held.key()));
    }

    #[test]
    fn lazy_store_without_session_has_no_lock() {
        let request = Arc::new(MemoryRequest::new());
        let mut store = LazySessionBeanStore::new(NamingScheme::new("session", "s"), request.clone());
        store.attach();
        assert!(store.lock(&BeanIdentifier::new("a")).is_none());
        assert_eq!(request.sessions_created(), 0);
    }
}
