//! Contexts
//!
//! A context routes the container's get/create calls for one scope to the
//! bean store currently associated with the unit of work. [`BoundContext`] is
//! the associate/activate/deactivate/dissociate state machine shared by the
//! request and session contexts; the conversation context layers its own
//! protocol over the same helpers.

mod bound;
mod request;
mod session;

pub use bound::{BoundContext, StoreFactory};
pub use request::{request_context, RequestContext};
pub use session::{session_context, SessionContext, SessionDestructionContext};

use crate::cache::RequestScopedCache;
use crate::error::Result;
use scoped_store::{
    BeanIdentifier, BoundBeanStore, Contextual, ContextualInstance, CreationalContext,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Scope served by a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    /// One request
    Request,
    /// One session
    Session,
    /// One conversation
    Conversation,
}

impl ScopeType {
    /// Scope type component of attribute keys
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Session => "session",
            Self::Conversation => "conversation",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container-facing view of a context
pub trait Context {
    /// Scope this context serves
    fn scope(&self) -> ScopeType;

    /// Whether get/create may be called
    fn is_active(&self) -> bool;

    /// Existing instance, never creates
    ///
    /// # Errors
    /// Returns `ContextError::NotActive` if the context is inactive.
    fn get(&mut self, id: &BeanIdentifier) -> Result<Option<ContextualInstance>>;

    /// Existing instance, or a new one created through the contextual
    ///
    /// # Errors
    /// Returns `ContextError::NotActive` if the context is inactive,
    /// `ContextError::NoBeanStore` if nothing is associated, or the
    /// contextual's `ContextError::Creation` failure.
    fn get_or_create(&mut self, contextual: &Arc<dyn Contextual>) -> Result<ContextualInstance>;

    /// Remove and destroy one instance
    ///
    /// Returns whether an instance was destroyed.
    ///
    /// # Errors
    /// Returns `ContextError::NotActive` if the context is inactive.
    fn destroy_instance(&mut self, id: &BeanIdentifier) -> Result<bool>;
}

/// Run an instance's destruction callback, containing failures and panics
///
/// Returns whether this call ran the callback successfully.
pub(crate) fn run_destruction(instance: &ContextualInstance) -> bool {
    let id = instance.identifier();
    match panic::catch_unwind(AssertUnwindSafe(|| instance.destroy())) {
        Ok(Ok(destroyed)) => destroyed,
        Ok(Err(err)) => {
            tracing::warn!("Failed to destroy contextual instance: {}", err);
            false
        }
        Err(_) => {
            tracing::warn!(bean = %id, "destruction callback panicked");
            false
        }
    }
}

/// Destroy every instance of a store, one failure never stopping the rest
pub(crate) fn destroy_all(store: &mut dyn BoundBeanStore) -> usize {
    let ids: Vec<BeanIdentifier> = store.keys().collect();
    let mut destroyed = 0;
    for id in ids {
        if let Some(instance) = store.remove(&id) {
            if run_destruction(&instance) {
                destroyed += 1;
            }
        }
    }
    store.clear();
    destroyed
}

/// Get-or-create over a store
///
/// With `multithreaded` set, creation is serialized per bean through the
/// store's lock and the lookup is repeated once the lock is held.
pub(crate) fn get_or_create_in(
    store: &mut dyn BoundBeanStore,
    contextual: &Arc<dyn Contextual>,
    multithreaded: bool,
) -> Result<ContextualInstance> {
    let id = contextual.identifier();
    if let Some(existing) = store.get(&id) {
        return Ok(existing);
    }
    let _lock = if multithreaded { store.lock(&id) } else { None };
    if let Some(existing) = store.get(&id) {
        return Ok(existing);
    }
    let mut creational = CreationalContext::new();
    let instance = contextual.create(&mut creational)?;
    let instance = ContextualInstance::new(Arc::clone(contextual), instance, creational);
    store.put(id.clone(), instance.clone());
    tracing::trace!(bean = %id, "contextual instance created");
    Ok(instance)
}

/// Cache key of an instance of `scope`
pub(crate) fn cache_key(scope: ScopeType, id: &BeanIdentifier) -> String {
    format!("{}#{}", scope.as_str(), id)
}

/// Lookup through the request cache, falling back to the store
pub(crate) fn cached_get_or_create(
    cache: Option<&RequestScopedCache>,
    scope: ScopeType,
    store: &mut dyn BoundBeanStore,
    contextual: &Arc<dyn Contextual>,
    multithreaded: bool,
) -> Result<ContextualInstance> {
    let Some(cache) = cache else {
        return get_or_create_in(store, contextual, multithreaded);
    };
    let key = cache_key(scope, &contextual.identifier());
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }
    let instance = get_or_create_in(store, contextual, multithreaded)?;
    cache.insert_if_active(key, instance.clone());
    Ok(instance)
}
