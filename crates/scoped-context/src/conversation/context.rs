use super::conversation_scheme;
use super::propagation::determine_conversation_id;
use super::reaper::{discard_lock, end_conversation, reap_expired};
use super::record::{ConversationRegistry, ConversationSnapshot, ManagedConversation};
use crate::config::{Clock, ContextConfig};
use crate::context::{destroy_all, get_or_create_in, run_destruction, Context, ScopeType};
use crate::error::{ContextError, ConversationError, Result};
use scoped_store::{
    BeanIdentifier, BeanStore, BoundBeanStore, Contextual, ContextualInstance,
    EagerSessionBeanStore, HeldLock, LazySessionBeanStore, LockStore, RequestHost, SessionHost,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Context id of the store a transient conversation writes into
const TRANSIENT_CID: &str = "transient";

#[derive(Default)]
struct CurrentConversation {
    /// Set while long-running
    id: Option<String>,
    /// Record of the long-running conversation, kept after `end` until
    /// deactivation
    record: Option<Arc<ManagedConversation>>,
    registry: Option<Arc<ConversationRegistry>>,
    /// Session holding the record
    session: Option<Arc<dyn SessionHost>>,
    lock: Option<HeldLock>,
    timeout_ms: u64,
}

/// Conversation context of one worker
///
/// Per request: [`associate`](Self::associate), [`activate`](Self::activate),
/// use, [`deactivate`](Self::deactivate), [`dissociate`](Self::dissociate).
///
/// Activation resolves the propagated id. Resuming a long-running
/// conversation takes its lock with a bounded wait; on timeout the request
/// gets [`ConversationError::Busy`], and an unknown, ended or expired id gets
/// [`ConversationError::Nonexistent`]. Either way the request continues with
/// a fresh transient conversation and every later bean access raises the same
/// condition again.
///
/// The lazy variant defers resolution to the first access.
pub struct ConversationContext {
    config: ContextConfig,
    clock: Arc<dyn Clock>,
    lazy: bool,
    request: Option<Arc<dyn RequestHost>>,
    store: Option<LazySessionBeanStore>,
    current: CurrentConversation,
    active: bool,
    initialized: bool,
    failure: Option<ConversationError>,
}

impl ConversationContext {
    /// Create unassociated context
    #[must_use]
    pub fn new(config: &ContextConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.clone(),
            clock,
            lazy: config.lazy_conversation_context,
            request: None,
            store: None,
            current: CurrentConversation::default(),
            active: false,
            initialized: false,
            failure: None,
        }
    }

    /// Whether resolution is deferred to first access
    #[inline]
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Whether the propagated id has been resolved in this activation
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Bind to a request
    ///
    /// Returns `false` when a leaked association had to be replaced.
    pub fn associate(&mut self, request: &Arc<dyn RequestHost>) -> bool {
        let leaked = self.request.is_some();
        if leaked {
            tracing::warn!("conversation context leak during association, previous request was not dissociated");
            self.reset();
        }
        self.request = Some(Arc::clone(request));
        !leaked
    }

    /// Unbind from the request
    pub fn dissociate(&mut self) -> bool {
        if self.request.is_none() {
            return false;
        }
        self.reset();
        self.request = None;
        true
    }

    /// Whether a request is bound
    #[inline]
    #[must_use]
    pub fn is_associated(&self) -> bool {
        self.request.is_some()
    }

    fn reset(&mut self) {
        self.current = CurrentConversation::default();
        self.store = None;
        self.active = false;
        self.initialized = false;
        self.failure = None;
    }

    /// Activate, resolving the propagated id unless lazy
    ///
    /// # Errors
    /// Returns [`ContextError::NotAssociated`] without a request, or the
    /// busy/nonexistent condition of the propagated id. The context is
    /// active either way.
    pub fn activate(&mut self) -> Result<()> {
        let Some(request) = self.request.clone() else {
            return Err(ContextError::NotAssociated(ScopeType::Conversation));
        };
        if self.active {
            tracing::warn!("conversation context already active");
        }
        self.active = true;
        self.initialized = false;
        self.failure = None;
        if self.lazy {
            return Ok(());
        }
        let cid = determine_conversation_id(request.as_ref(), &self.config.parameter_name);
        self.initialize(&request, cid.as_deref())?;
        Ok(())
    }

    fn initialize(
        &mut self,
        request: &Arc<dyn RequestHost>,
        cid: Option<&str>,
    ) -> std::result::Result<(), ConversationError> {
        self.initialized = true;
        self.failure = None;
        self.current = CurrentConversation {
            timeout_ms: self.config.default_timeout_ms,
            ..CurrentConversation::default()
        };
        self.store = Some(LazySessionBeanStore::new(
            conversation_scheme(&self.config.context_id, TRANSIENT_CID),
            Arc::clone(request),
        ));
        let Some(cid) = cid.filter(|cid| !cid.is_empty()) else {
            return Ok(());
        };
        self.resume(request, cid).map_err(|err| {
            tracing::warn!("Conversation {} not restored: {}", cid, err);
            self.failure = Some(err.clone());
            err
        })
    }

    fn resume(
        &mut self,
        request: &Arc<dyn RequestHost>,
        cid: &str,
    ) -> std::result::Result<(), ConversationError> {
        let nonexistent = || ConversationError::Nonexistent(cid.to_string());
        let session = existing_session(request.as_ref()).ok_or_else(nonexistent)?;
        let registry = ConversationRegistry::existing(session.as_ref(), &self.config.context_id)
            .ok_or_else(nonexistent)?;
        let record = registry.get(cid).ok_or_else(nonexistent)?;
        let locks = LockStore::for_session(session.as_ref())
            .ok_or_else(|| ConversationError::SessionUnavailable("no lock store".to_string()))?;

        if record.is_expired(self.clock.now_ms()) {
            if let Some(_lock) = locks.try_lock_for(record.lock_key(), Duration::ZERO) {
                if !record.is_ended() {
                    end_conversation(&session, &registry, &record);
                }
            }
            return Err(nonexistent());
        }

        let wait = self.config.concurrent_access_timeout();
        let Some(lock) = locks.try_lock_for(record.lock_key(), wait) else {
            return Err(ConversationError::Busy {
                id: cid.to_string(),
                waited_ms: self.config.concurrent_access_timeout_ms,
            });
        };

        // the previous holder may have ended it while we waited
        let now = self.clock.now_ms();
        if record.is_ended() {
            return Err(nonexistent());
        }
        if record.is_expired(now) {
            end_conversation(&session, &registry, &record);
            return Err(nonexistent());
        }
        record.cancel_termination();
        record.touch(now);

        let mut store = LazySessionBeanStore::new(record.scheme(), Arc::clone(request));
        store.attach();
        self.store = Some(store);
        self.current = CurrentConversation {
            id: Some(cid.to_string()),
            timeout_ms: record.timeout_ms(),
            record: Some(record),
            registry: Some(registry),
            session: Some(session),
            lock: Some(lock),
        };
        tracing::debug!(conversation = cid, "conversation resumed");
        Ok(())
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if !self.active {
            return Err(ContextError::NotActive(ScopeType::Conversation));
        }
        if !self.initialized {
            let Some(request) = self.request.clone() else {
                return Err(ContextError::NotAssociated(ScopeType::Conversation));
            };
            let cid = determine_conversation_id(request.as_ref(), &self.config.parameter_name);
            if let Err(err) = self.initialize(&request, cid.as_deref()) {
                tracing::debug!("conversation unavailable until the request ends: {}", err);
            }
        }
        Ok(())
    }

    fn ensure_ready(&mut self) -> Result<&mut LazySessionBeanStore> {
        self.ensure_initialized()?;
        if let Some(failure) = &self.failure {
            return Err(failure.clone().into());
        }
        self.store
            .as_mut()
            .ok_or(ContextError::NoBeanStore(ScopeType::Conversation))
    }

    /// Id of the current conversation, `None` while transient
    #[must_use]
    pub fn id(&mut self) -> Option<String> {
        self.ensure_initialized().ok()?;
        self.current.id.clone()
    }

    /// Whether the current conversation is transient
    #[must_use]
    pub fn is_transient(&mut self) -> bool {
        self.id().is_none()
    }

    /// Timeout of the current conversation
    #[must_use]
    pub fn timeout_ms(&mut self) -> u64 {
        if self.ensure_initialized().is_err() {
            return self.config.default_timeout_ms;
        }
        self.current.timeout_ms
    }

    /// Set the timeout of the current conversation
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        if self.ensure_initialized().is_err() {
            return;
        }
        self.current.timeout_ms = timeout_ms;
        if let Some(record) = &self.current.record {
            record.set_timeout_ms(timeout_ms);
        }
    }

    /// Promote the current conversation to long-running
    ///
    /// Generates an id unless `id` is given. Creates the session if needed.
    ///
    /// # Errors
    /// [`ConversationError::AlreadyLongRunning`] if already promoted,
    /// [`ConversationError::IdInUse`] for a taken id,
    /// [`ConversationError::SessionUnavailable`] if no session can be had,
    /// or the busy/nonexistent condition raised at activation.
    pub fn begin(&mut self, id: Option<&str>) -> Result<String> {
        self.ensure_ready()?;
        if let Some(current) = &self.current.id {
            return Err(ConversationError::AlreadyLongRunning(current.clone()).into());
        }
        let request = self
            .request
            .clone()
            .ok_or(ContextError::NotAssociated(ScopeType::Conversation))?;
        let session = request
            .session(true)
            .map_err(|err| ConversationError::SessionUnavailable(err.to_string()))?
            .ok_or_else(|| ConversationError::SessionUnavailable("no session".to_string()))?;
        let unavailable = || ConversationError::SessionUnavailable(session.id().to_string());
        let registry = ConversationRegistry::for_session(session.as_ref(), &self.config.context_id)
            .ok_or_else(unavailable)?;
        let locks = LockStore::for_session(session.as_ref()).ok_or_else(unavailable)?;

        let cid = match id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => registry.generate_id(),
        };
        let record = Arc::new(ManagedConversation::new(
            &self.config.context_id,
            cid.clone(),
            self.clock.now_ms(),
            self.current.timeout_ms,
        ));
        let lock = locks
            .try_lock_for(record.lock_key(), Duration::ZERO)
            .ok_or_else(|| ConversationError::IdInUse(cid.clone()))?;
        registry.insert(Arc::clone(&record))?;

        self.current.id = Some(cid.clone());
        self.current.record = Some(record);
        self.current.registry = Some(registry);
        self.current.session = Some(session);
        self.current.lock = Some(lock);
        tracing::debug!(conversation = %cid, "conversation begun");
        Ok(cid)
    }

    /// Demote the current conversation to transient
    ///
    /// Its instances are destroyed when the request ends.
    ///
    /// # Errors
    /// [`ConversationError::NotLongRunning`] if already transient, or the
    /// busy/nonexistent condition raised at activation.
    pub fn end(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let Some(cid) = self.current.id.take() else {
            return Err(ConversationError::NotLongRunning.into());
        };
        if let (Some(record), Some(registry)) = (&self.current.record, &self.current.registry) {
            record.mark_ended();
            registry.remove(record);
        }
        tracing::debug!(conversation = %cid, "conversation ended");
        Ok(())
    }

    /// Ids of the long-running conversations of the request's session
    #[must_use]
    pub fn conversations(&self) -> Vec<String> {
        self.registry()
            .map(|registry| registry.ids())
            .unwrap_or_default()
    }

    /// Snapshots of the long-running conversations of the request's session
    #[must_use]
    pub fn snapshots(&self) -> Vec<ConversationSnapshot> {
        self.registry()
            .map(|registry| registry.all().iter().map(|c| c.snapshot()).collect())
            .unwrap_or_default()
    }

    fn registry(&self) -> Option<Arc<ConversationRegistry>> {
        let session = existing_session(self.request.as_deref()?)?;
        ConversationRegistry::existing(session.as_ref(), &self.config.context_id)
    }

    /// Sweep expired conversations of the request's session
    pub fn reap_expired(&self) -> usize {
        let Some(session) = self.request.as_deref().and_then(existing_session) else {
            return 0;
        };
        reap_expired(&session, &self.config.context_id, self.clock.now_ms())
    }

    /// Persist or discard the current conversation and release its lock
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        let current = std::mem::take(&mut self.current);
        let store = self.store.take();
        if self.initialized {
            let now = self.clock.now_ms();
            match (&current.id, &current.record, store) {
                (Some(cid), Some(record), Some(store)) => {
                    record.touch(now);
                    record.schedule_termination(now);
                    if keep(&current, record, store) {
                        tracing::debug!(
                            conversation = %cid,
                            expires_at_ms = ?record.expires_at_ms(),
                            "conversation kept"
                        );
                    }
                }
                (None, _, Some(mut store)) => {
                    let destroyed = destroy_all(&mut store);
                    tracing::trace!(destroyed, "transient conversation discarded");
                }
                _ => {}
            }
        }
        drop(current.lock);
        if let (Some(record), Some(session)) = (&current.record, &current.session) {
            discard_lock(session.as_ref(), record);
        }
        self.initialized = false;
        self.failure = None;
        if self.config.reap_expired_on_deactivate {
            self.reap_expired();
        }
        self.active = false;
    }
}

/// Leave a long-running conversation's instances in its session
///
/// A conversation whose session was invalidated during the request is ended
/// instead, so its instances are destroyed exactly once. Returns whether the
/// conversation is still long-running.
fn keep(
    current: &CurrentConversation,
    record: &Arc<ManagedConversation>,
    mut store: LazySessionBeanStore,
) -> bool {
    let (Some(session), Some(registry)) = (&current.session, &current.registry) else {
        return false;
    };
    if !session.is_valid() {
        let destroyed = destroy_all(&mut store) + end_conversation(session, registry, record);
        tracing::debug!(
            conversation = record.id(),
            destroyed,
            "session invalidated, conversation ended"
        );
        return false;
    }
    if store.is_attached() && store.scheme() == &record.scheme() {
        return true;
    }
    if promote(store, session, record) {
        return true;
    }
    tracing::warn!(
        conversation = record.id(),
        "conversation instances could not be stored in the session, ending it"
    );
    end_conversation(session, registry, record);
    false
}

/// Move a store's instances under the long-running conversation's keys
///
/// Writes go to the session holding the record. On failure the moved
/// instances are destroyed and `false` is returned.
fn promote(
    mut store: LazySessionBeanStore,
    session: &Arc<dyn SessionHost>,
    record: &ManagedConversation,
) -> bool {
    let ids: Vec<BeanIdentifier> = store.keys().collect();
    let entries: Vec<_> = ids
        .into_iter()
        .filter_map(|id| store.get(&id).map(|instance| (id, instance)))
        .collect();
    store.clear();

    let mut promoted = EagerSessionBeanStore::new(record.scheme(), Arc::clone(session));
    for (id, instance) in entries {
        promoted.put(id, instance);
    }
    if promoted.attach() {
        tracing::debug!(conversation = record.id(), "conversation promoted to long-running");
        return true;
    }
    let destroyed = destroy_all(&mut promoted);
    tracing::debug!(conversation = record.id(), destroyed, "unpromoted instances destroyed");
    false
}

fn existing_session(request: &dyn RequestHost) -> Option<Arc<dyn SessionHost>> {
    request.session(false).ok().flatten()
}

impl Context for ConversationContext {
    fn scope(&self) -> ScopeType {
        ScopeType::Conversation
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn get(&mut self, id: &BeanIdentifier) -> Result<Option<ContextualInstance>> {
        Ok(self.ensure_ready()?.get(id))
    }

    fn get_or_create(&mut self, contextual: &Arc<dyn Contextual>) -> Result<ContextualInstance> {
        get_or_create_in(self.ensure_ready()?, contextual, false)
    }

    fn destroy_instance(&mut self, id: &BeanIdentifier) -> Result<bool> {
        Ok(self
            .ensure_ready()?
            .remove(id)
            .is_some_and(|instance| run_destruction(&instance)))
    }
}

impl fmt::Debug for ConversationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationContext")
            .field("lazy", &self.lazy)
            .field("associated", &self.request.is_some())
            .field("active", &self.active)
            .field("initialized", &self.initialized)
            .field("conversation", &self.current.id)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}
