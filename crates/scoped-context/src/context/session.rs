use super::{BoundContext, Context, ScopeType};
use crate::config::{ContextConfig, SessionStoreKind};
use crate::error::Result;
use scoped_store::{
    BeanIdentifier, BoundBeanStore, Contextual, ContextualInstance, EagerSessionBeanStore,
    LazyCyclicSessionBeanStore, LazySessionBeanStore, NamingScheme, RequestHost,
    SessionCreationListener, SessionHost,
};
use std::sync::Arc;

/// Session context, associated per request
pub type SessionContext = BoundContext<Arc<dyn RequestHost>>;

/// Build the session context
///
/// The store fetches the session from the request lazily, so requests that
/// only read session state never create one. Creation is serialized per bean
/// because concurrent requests share the session.
#[must_use]
pub fn session_context(
    config: &ContextConfig,
    listener: Option<Arc<dyn SessionCreationListener>>,
) -> SessionContext {
    let scheme = NamingScheme::new(ScopeType::Session.as_str(), &config.context_id);
    let kind = config.session_store;
    BoundContext::new(ScopeType::Session, move |request: &Arc<dyn RequestHost>| {
        let request = Arc::clone(request);
        match kind {
            SessionStoreKind::Lazy => {
                Box::new(LazySessionBeanStore::new(scheme.clone(), request)) as Box<dyn BoundBeanStore>
            }
            SessionStoreKind::LazyCyclic => Box::new(LazyCyclicSessionBeanStore::new(
                scheme.clone(),
                request,
                listener.clone(),
            )),
        }
    })
    .multithreaded()
}

/// Context for destroying a session outside of any request
///
/// Binds an eager store straight to the dying session. If a store is
/// already bound the request path got there first and association is
/// refused.
#[derive(Debug)]
pub struct SessionDestructionContext {
    inner: BoundContext<Arc<dyn SessionHost>>,
}

impl SessionDestructionContext {
    /// Create unassociated destruction context
    #[must_use]
    pub fn new(context_id: &str) -> Self {
        let scheme = NamingScheme::new(ScopeType::Session.as_str(), context_id);
        let inner = BoundContext::new(ScopeType::Session, move |session: &Arc<dyn SessionHost>| {
            Box::new(EagerSessionBeanStore::new(scheme.clone(), Arc::clone(session)))
                as Box<dyn BoundBeanStore>
        })
        .multithreaded();
        Self { inner }
    }

    /// Bind to `session` unless already bound
    pub fn associate(&mut self, session: &Arc<dyn SessionHost>) -> bool {
        if self.inner.is_associated() {
            return false;
        }
        self.inner.associate(session)
    }

    /// Detach from the session
    pub fn dissociate(&mut self) -> bool {
        self.inner.dissociate()
    }

    /// Whether a session is bound
    #[must_use]
    pub fn is_associated(&self) -> bool {
        self.inner.is_associated()
    }

    /// Allow get/create
    pub fn activate(&mut self) {
        self.inner.activate();
    }

    /// Disallow get/create
    pub fn deactivate(&mut self) {
        self.inner.deactivate();
    }

    /// Mark for destruction at the next deactivation
    pub fn invalidate(&mut self) {
        self.inner.invalidate();
    }

    /// Destroy every session instance, then dissociate
    pub fn destroy(&mut self) -> usize {
        self.inner.destroy()
    }
}

impl Context for SessionDestructionContext {
    fn scope(&self) -> ScopeType {
        ScopeType::Session
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn get(&mut self, id: &BeanIdentifier) -> Result<Option<ContextualInstance>> {
        self.inner.get(id)
    }

    fn get_or_create(&mut self, contextual: &Arc<dyn Contextual>) -> Result<ContextualInstance> {
        self.inner.get_or_create(contextual)
    }

    fn destroy_instance(&mut self, id: &BeanIdentifier) -> Result<bool> {
        self.inner.destroy_instance(id)
    }
}
