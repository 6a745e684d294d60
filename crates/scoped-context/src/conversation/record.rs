//! Long-running conversation records and the per-session registry

use super::conversation_scheme;
use crate::error::ConversationError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use scoped_store::{shared_attribute, typed_attribute, NamingScheme, SessionHost};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Session attribute prefix of the conversation registries
pub const CONVERSATIONS_ATTRIBUTE: &str = "scoped.conversations";

/// Session attribute holding the registry of one deployment
#[must_use]
pub fn registry_attribute(context_id: &str) -> String {
    format!("{CONVERSATIONS_ATTRIBUTE}#{context_id}")
}

/// Scope type component of conversation lock keys
const LOCK_SCOPE: &str = "conversation-lock";

#[derive(Debug)]
struct ConversationState {
    last_used_ms: u64,
    timeout_ms: u64,
    expires_at_ms: Option<u64>,
    ended: bool,
}

/// A long-running conversation known to a session
#[derive(Debug)]
pub struct ManagedConversation {
    id: String,
    context_id: String,
    lock_key: String,
    state: Mutex<ConversationState>,
}

impl ManagedConversation {
    /// Create record for a conversation of deployment `context_id` begun at
    /// `now_ms`
    #[must_use]
    pub fn new(context_id: &str, id: impl Into<String>, now_ms: u64, timeout_ms: u64) -> Self {
        let id = id.into();
        let lock_key = NamingScheme::new(LOCK_SCOPE, context_id)
            .child(&id)
            .key_prefix()
            .to_string();
        Self {
            id,
            context_id: context_id.to_string(),
            lock_key,
            state: Mutex::new(ConversationState {
                last_used_ms: now_ms,
                timeout_ms,
                expires_at_ms: None,
                ended: false,
            }),
        }
    }

    /// Conversation id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deployment owning this conversation
    #[inline]
    #[must_use]
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Naming scheme of this conversation's instances
    #[must_use]
    pub fn scheme(&self) -> NamingScheme {
        conversation_scheme(&self.context_id, &self.id)
    }

    /// Key of this conversation's lock in the session lock store
    #[inline]
    #[must_use]
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Configured timeout
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.state.lock().timeout_ms
    }

    /// Change the timeout; applies from the next schedule
    pub fn set_timeout_ms(&self, timeout_ms: u64) {
        self.state.lock().timeout_ms = timeout_ms;
    }

    /// Last access time
    #[must_use]
    pub fn last_used_ms(&self) -> u64 {
        self.state.lock().last_used_ms
    }

    /// Record an access
    pub fn touch(&self, now_ms: u64) {
        self.state.lock().last_used_ms = now_ms;
    }

    /// Drop the termination deadline while a request uses the conversation
    pub fn cancel_termination(&self) {
        self.state.lock().expires_at_ms = None;
    }

    /// Terminate at `now + timeout` unless resumed first
    pub fn schedule_termination(&self, now_ms: u64) {
        let mut state = self.state.lock();
        state.expires_at_ms = Some(now_ms.saturating_add(state.timeout_ms));
    }

    /// Scheduled termination deadline
    #[must_use]
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.state.lock().expires_at_ms
    }

    /// Whether the termination deadline has passed
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.state
            .lock()
            .expires_at_ms
            .is_some_and(|deadline| now_ms >= deadline)
    }

    /// Mark ended; a request that resumes it afterwards sees it as gone
    pub fn mark_ended(&self) {
        self.state.lock().ended = true;
    }

    /// Whether the conversation has ended
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    /// Serializable snapshot
    #[must_use]
    pub fn snapshot(&self) -> ConversationSnapshot {
        let state = self.state.lock();
        ConversationSnapshot {
            id: self.id.clone(),
            last_used_ms: state.last_used_ms,
            timeout_ms: state.timeout_ms,
            expires_at_ms: state.expires_at_ms,
        }
    }
}

/// Point-in-time view of a conversation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSnapshot {
    /// Conversation id
    pub id: String,
    /// Last access time
    pub last_used_ms: u64,
    /// Timeout
    pub timeout_ms: u64,
    /// Termination deadline, absent while in use
    pub expires_at_ms: Option<u64>,
}

/// Long-running conversations of one deployment in one session
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: DashMap<String, Arc<ManagedConversation>>,
    next_id: AtomicU64,
}

impl ConversationRegistry {
    /// Registry of a deployment in a session, created at most once
    #[must_use]
    pub fn for_session(session: &dyn SessionHost, context_id: &str) -> Option<Arc<Self>> {
        let attribute = registry_attribute(context_id);
        let registry = shared_attribute(session, &attribute, Self::default);
        if registry.is_none() {
            tracing::warn!(
                session = session.id(),
                "session attribute {} does not hold a conversation registry",
                attribute
            );
        }
        registry
    }

    /// Registry of a deployment in a session, without creating one
    #[must_use]
    pub fn existing(session: &dyn SessionHost, context_id: &str) -> Option<Arc<Self>> {
        typed_attribute(session, &registry_attribute(context_id))
    }

    /// Next unused generated id
    #[must_use]
    pub fn generate_id(&self) -> String {
        loop {
            let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
            if !self.conversations.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a conversation under its id
    ///
    /// # Errors
    /// Returns [`ConversationError::IdInUse`] if the id is taken.
    pub fn insert(&self, conversation: Arc<ManagedConversation>) -> Result<(), ConversationError> {
        match self.conversations.entry(conversation.id().to_string()) {
            Entry::Occupied(_) => Err(ConversationError::IdInUse(conversation.id().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(conversation);
                Ok(())
            }
        }
    }

    /// Look up a conversation
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ManagedConversation>> {
        self.conversations.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `conversation`, unless its id now names a different record
    pub fn remove(&self, conversation: &Arc<ManagedConversation>) -> bool {
        self.conversations
            .remove_if(conversation.id(), |_, current| Arc::ptr_eq(current, conversation))
            .is_some()
    }

    /// Snapshot of every record
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ManagedConversation>> {
        let mut all: Vec<_> = self
            .conversations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Ids of every record, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.all().iter().map(|c| c.id().to_string()).collect()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether there are no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
