//! Conversations
//!
//! A conversation is transient unless a request promotes it with `begin`.
//! Long-running conversations live in the session: their record in the
//! session's [`ConversationRegistry`], their instances under a
//! per-conversation naming scheme, and their lock in the session
//! [`LockStore`](scoped_store::LockStore). All three are keyed by the
//! deployment's context id, so deployments sharing a session never see
//! each other's conversations. Requests carry the id between
//! each other through one parameter, see [`propagation`].

mod context;
pub mod propagation;
mod reaper;
mod record;

pub use context::ConversationContext;
pub use propagation::{determine_conversation_id, propagate_url};
pub use reaper::{destroy_conversations, reap_expired};
pub use record::{
    registry_attribute, ConversationRegistry, ConversationSnapshot, ManagedConversation,
    CONVERSATIONS_ATTRIBUTE,
};

use crate::context::ScopeType;
use scoped_store::NamingScheme;

/// Naming scheme of a long-running conversation's instances
#[must_use]
pub fn conversation_scheme(context_id: &str, cid: &str) -> NamingScheme {
    NamingScheme::new(ScopeType::Conversation.as_str(), context_id).child(cid)
}
