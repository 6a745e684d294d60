//! Scoped Context - lifecycle and conversation engine for scoped instances
//!
//! Builds on [`scoped_store`] to provide:
//! - Request and session contexts bound per unit of work
//! - Conversations with lock-protected resumption, timeouts and propagation
//! - Session destruction that runs exactly once, in or out of a request
//! - A per-worker [`ContextLifecycle`] that drives the fixed request order
//!
//! # Example
//!
//! ```rust
//! use scoped_context::prelude::*;
//! use scoped_store::MemoryRequest;
//! use std::sync::Arc;
//!
//! let mut lifecycle = ContextLifecycle::new(ContextConfig::new());
//! let request: Arc<dyn RequestHost> = Arc::new(MemoryRequest::new());
//!
//! let mut scope = lifecycle.begin_request(&request);
//! assert!(scope.activation_error().is_none());
//! let cid = scope.conversation().begin(None).unwrap();
//! assert_eq!(scope.conversation().id(), Some(cid));
//! ```

#![warn(unreachable_pub)]

pub mod cache;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod lifecycle;

pub use cache::RequestScopedCache;
pub use config::{Clock, ContextConfig, ManualClock, SessionStoreKind, SystemClock};
pub use context::{
    request_context, session_context, BoundContext, Context, RequestContext, ScopeType,
    SessionContext, SessionDestructionContext, StoreFactory,
};
pub use conversation::{
    conversation_scheme, destroy_conversations, determine_conversation_id, propagate_url,
    reap_expired, ConversationContext, ConversationRegistry, ConversationSnapshot,
    ManagedConversation,
};
pub use error::{ConfigError, ContextError, ConversationError, Result};
pub use lifecycle::{ContextLifecycle, RequestScope};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving scoped contexts
    pub use crate::{
        Context, ContextConfig, ContextError, ContextLifecycle, ConversationContext,
        ConversationError, RequestScope, ScopeType,
    };
    pub use scoped_store::{Contextual, ContextualInstance, RequestHost, SessionHost};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
