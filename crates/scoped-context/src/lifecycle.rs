//! Per-worker request lifecycle
//!
//! [`ContextLifecycle`] owns one worker's contexts and drives them through
//! the fixed per-request order: associate, activate, business logic,
//! deactivate, dissociate. [`RequestScope`] runs the closing half of that
//! sequence on drop, so it also runs when business logic panics.

use crate::cache::RequestScopedCache;
use crate::config::{Clock, ContextConfig, SystemClock};
use crate::context::{
    request_context, session_context, Context, RequestContext, ScopeType, SessionContext,
    SessionDestructionContext,
};
use crate::conversation::{destroy_conversations, ConversationContext};
use crate::error::{ContextError, Result};
use scoped_store::{Contextual, ContextualInstance, RequestHost, SessionCreationListener, SessionHost};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Contexts of one worker thread
pub struct ContextLifecycle {
    config: ContextConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<RequestScopedCache>,
    request: RequestContext,
    session: SessionContext,
    conversation: ConversationContext,
    destruction: SessionDestructionContext,
    current: Option<Arc<dyn RequestHost>>,
    deferred: Option<Arc<dyn SessionHost>>,
}

impl ContextLifecycle {
    /// Create lifecycle with the wall clock
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(RequestScopedCache::new());
        Self {
            request: request_context(&config.context_id, Arc::clone(&cache)),
            session: session_context(&config, None),
            conversation: ConversationContext::new(&config, Arc::clone(&clock)),
            destruction: SessionDestructionContext::new(&config.context_id),
            config,
            clock,
            cache,
            current: None,
            deferred: None,
        }
    }

    /// With a time source for conversation timeouts
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.conversation = ConversationContext::new(&self.config, Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// With a callback for sessions created by session-scoped writes
    ///
    /// Only consulted by the lazy cyclic session store.
    #[must_use]
    pub fn with_session_listener(mut self, listener: Arc<dyn SessionCreationListener>) -> Self {
        self.session = session_context(&self.config, Some(listener));
        self
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Time source in use
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The worker's request cache
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<RequestScopedCache> {
        &self.cache
    }

    /// Whether a request is in flight
    #[inline]
    #[must_use]
    pub fn in_request(&self) -> bool {
        self.current.is_some()
    }

    /// Associate and activate every context for `request`
    ///
    /// # Errors
    /// Returns the busy/nonexistent condition of the propagated conversation
    /// id. The request is set up regardless and must still be ended with
    /// [`request_destroyed`](Self::request_destroyed).
    pub fn request_initialized(&mut self, request: &Arc<dyn RequestHost>) -> Result<()> {
        if self.destruction.is_associated() || self.destruction.is_active() {
            tracing::warn!("session destruction context leaked into a request, cleaning up");
            self.destruction.deactivate();
            self.destruction.dissociate();
        }
        if self.current.is_some() {
            tracing::warn!("previous request was not destroyed before a new one started");
        }
        self.current = Some(Arc::clone(request));

        self.request.associate(request);
        self.request.activate();
        self.session.associate(request);
        self.session.activate();
        self.conversation.associate(request);
        self.conversation.activate()
    }

    /// Deactivate and dissociate every context
    ///
    /// Runs a deferred session destruction last.
    pub fn request_destroyed(&mut self) {
        if self.current.take().is_none() {
            return;
        }
        self.conversation.deactivate();
        self.conversation.dissociate();

        self.request.invalidate();
        self.request.deactivate();
        self.request.dissociate();

        if self.deferred.is_some() {
            self.session.invalidate();
        }
        self.session.deactivate();
        self.session.dissociate();

        if let Some(session) = self.deferred.take() {
            self.destroy_session(&session);
        }
    }

    /// A session has been invalidated
    ///
    /// If this worker is serving a request on that session the destruction
    /// waits for the request to end and `false` is returned. Otherwise the
    /// session's instances and conversations are destroyed now.
    pub fn session_destroyed(&mut self, session: &Arc<dyn SessionHost>) -> bool {
        let in_request = self
            .current
            .as_ref()
            .and_then(|request| request.session_id())
            .is_some_and(|id| id == session.id());
        if in_request {
            tracing::debug!(session = session.id(), "session destruction deferred to request end");
            self.deferred = Some(Arc::clone(session));
            return false;
        }
        self.destroy_session(session);
        true
    }

    fn destroy_session(&mut self, session: &Arc<dyn SessionHost>) -> usize {
        if !self.destruction.associate(session) {
            tracing::debug!(session = session.id(), "session destruction context already associated");
            return 0;
        }
        self.destruction.activate();
        let conversations = destroy_conversations(session, &self.config.context_id);
        let destroyed = self.destruction.destroy();
        self.destruction.deactivate();
        tracing::debug!(
            session = session.id(),
            destroyed,
            conversations,
            "session destroyed"
        );
        destroyed + conversations
    }

    /// Start a request; the returned guard ends it on drop
    pub fn begin_request(&mut self, request: &Arc<dyn RequestHost>) -> RequestScope<'_> {
        let activation = self.request_initialized(request).err();
        RequestScope {
            lifecycle: self,
            activation,
        }
    }

    /// Request context
    pub fn request_context(&mut self) -> &mut RequestContext {
        &mut self.request
    }

    /// Session context
    pub fn session_context(&mut self) -> &mut SessionContext {
        &mut self.session
    }

    /// Conversation context
    pub fn conversation(&mut self) -> &mut ConversationContext {
        &mut self.conversation
    }

    /// Session destruction context
    pub fn destruction_context(&mut self) -> &mut SessionDestructionContext {
        &mut self.destruction
    }

    /// Context serving `scope`
    pub fn context_for(&mut self, scope: ScopeType) -> &mut dyn Context {
        match scope {
            ScopeType::Request => &mut self.request,
            ScopeType::Session => &mut self.session,
            ScopeType::Conversation => &mut self.conversation,
        }
    }

    /// Instance of `contextual` in `scope`, created on first use
    ///
    /// # Errors
    /// See [`Context::get_or_create`].
    pub fn get_or_create(
        &mut self,
        scope: ScopeType,
        contextual: &Arc<dyn Contextual>,
    ) -> Result<ContextualInstance> {
        self.context_for(scope).get_or_create(contextual)
    }
}

impl fmt::Debug for ContextLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLifecycle")
            .field("in_request", &self.current.is_some())
            .field("request", &self.request)
            .field("session", &self.session)
            .field("conversation", &self.conversation)
            .field("deferred_destruction", &self.deferred.is_some())
            .finish_non_exhaustive()
    }
}

/// Guard over one in-flight request
///
/// Dereferences to the lifecycle. Dropping it ends the request.
pub struct RequestScope<'a> {
    lifecycle: &'a mut ContextLifecycle,
    activation: Option<ContextError>,
}

impl RequestScope<'_> {
    /// The error raised while activating, if any
    #[must_use]
    pub fn activation_error(&self) -> Option<&ContextError> {
        self.activation.as_ref()
    }
}

impl Deref for RequestScope<'_> {
    type Target = ContextLifecycle;

    fn deref(&self) -> &Self::Target {
        &*self.lifecycle
    }
}

impl DerefMut for RequestScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.lifecycle
    }
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        self.lifecycle.request_destroyed();
    }
}

impl fmt::Debug for RequestScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("activation", &self.activation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_store::{MemoryRequest, MemorySession};
    use scoped_test_utils::RecordingContextual;

    fn request_on(session: &Arc<MemorySession>) -> Arc<dyn RequestHost> {
        Arc::new(MemoryRequest::new().with_session(Arc::clone(session)))
    }

    #[test]
    fn request_beans_destroyed_at_request_end() {
        let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
        let recording = RecordingContextual::new("req.Bean");
        let bean: Arc<dyn Contextual> = recording.clone();
        let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());

        {
            let mut scope = lifecycle.begin_request(&request);
            assert!(scope.activation_error().is_none());
            scope.get_or_create(ScopeType::Request, &bean).unwrap();
        }
        assert_eq!(recording.destroyed(), 1);
        assert!(!lifecycle.in_request());
        assert!(!lifecycle.cache().is_active());
    }

    #[test]
    fn session_beans_survive_request_end() {
        let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
        let recording = RecordingContextual::new("shop.Cart");
        let bean: Arc<dyn Contextual> = recording.clone();
        let session = MemorySession::new();

        {
            let mut scope = lifecycle.begin_request(&request_on(&session));
            scope.get_or_create(ScopeType::Session, &bean).unwrap();
        }
        assert_eq!(recording.destroyed(), 0);
    }

    #[test]
    fn out_of_band_destruction_runs_immediately() {
        let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
        let recording = RecordingContextual::new("shop.Cart");
        let bean: Arc<dyn Contextual> = recording.clone();
        let session = MemorySession::new();

        {
            let mut scope = lifecycle.begin_request(&request_on(&session));
            scope.get_or_create(ScopeType::Session, &bean).unwrap();
        }
        session.invalidate();
        let dying: Arc<dyn SessionHost> = session;
        assert!(lifecycle.session_destroyed(&dying));
        assert_eq!(recording.destroyed(), 1);
        assert!(!lifecycle.destruction_context().is_associated());
    }

    #[test]
    fn in_request_destruction_is_deferred() {
        let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
        let recording = RecordingContextual::new("shop.Cart");
        let bean: Arc<dyn Contextual> = recording.clone();
        let session = MemorySession::new();
        let dying: Arc<dyn SessionHost> = session.clone();

        lifecycle.request_initialized(&request_on(&session)).unwrap();
        lifecycle.get_or_create(ScopeType::Session, &bean).unwrap();
        session.invalidate();
        assert!(!lifecycle.session_destroyed(&dying));
        assert_eq!(recording.destroyed(), 0);

        lifecycle.request_destroyed();
        assert_eq!(recording.destroyed(), 1);
    }

    #[test]
    fn leaked_destruction_context_cleaned_at_next_request() {
        let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
        let session: Arc<dyn SessionHost> = MemorySession::new();
        lifecycle.destruction_context().associate(&session);
        lifecycle.destruction_context().activate();

        let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());
        lifecycle.request_initialized(&request).unwrap();
        assert!(!lifecycle.destruction_context().is_associated());
        assert!(!lifecycle.destruction_context().is_active());
        lifecycle.request_destroyed();
    }
}
