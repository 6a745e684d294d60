//! Scoped Store - bean stores for scoped contextual instances
//!
//! Storage layer of the scoped lifecycle engine:
//! - Collision-free attribute keys per scope ([`NamingScheme`])
//! - Contextual instances with exactly-once destruction
//! - Request and session bean stores over container attribute bags
//! - Per-session lock store for creation and conversation locking
//!
//! # Example
//!
//! ```rust
//! use scoped_store::prelude::*;
//! use std::sync::Arc;
//!
//! let request = Arc::new(MemoryRequest::new());
//! let mut store = LazySessionBeanStore::new(NamingScheme::new("session", "main"), request.clone());
//! store.attach();
//!
//! // reads never create a session
//! assert!(store.get(&BeanIdentifier::new("shop.Cart")).is_none());
//! assert_eq!(request.sessions_created(), 0);
//! ```

#![warn(unreachable_pub)]

pub mod backend;
pub mod error;
pub mod host;
pub mod identifier;
pub mod instance;
pub mod lock;
pub mod memory;
pub mod naming;
pub mod store;

pub use backend::{AttributeBacking, AttributeValue, KeyValueBackend};
pub use error::{BackendError, CreationError, DestructionError, HostError};
pub use host::{shared_attribute, typed_attribute, RequestHost, SessionHost};
pub use identifier::BeanIdentifier;
pub use instance::{Contextual, ContextualInstance, CreationalContext, Instance};
pub use lock::{HeldLock, LockStore, LOCK_STORE_ATTRIBUTE};
pub use memory::{MemoryRequest, MemorySession};
pub use naming::NamingScheme;
pub use store::{
    AttributeBeanStore, BeanStore, BoundBeanStore, EagerSessionBeanStore,
    LazyCyclicSessionBackend, LazyCyclicSessionBeanStore, LazySessionBackend,
    LazySessionBeanStore, RequestAttributes, RequestBeanStore, SessionAttributes,
    SessionCreationListener, StagingScope,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with scoped stores
    pub use crate::{
        BeanIdentifier, BeanStore, BoundBeanStore, Contextual, ContextualInstance,
        CreationalContext, EagerSessionBeanStore, LazyCyclicSessionBeanStore,
        LazySessionBeanStore, MemoryRequest, MemorySession, NamingScheme, RequestBeanStore,
        RequestHost, SessionHost,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
