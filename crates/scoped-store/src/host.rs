//! Request and session host contracts
//!
//! Hosts are the container-native objects a request arrives with. This crate
//! treats them as opaque attribute bags keyed by string and never owns them;
//! stores only borrow them for the duration of an association.

use crate::backend::{AttributeValue, KeyValueBackend};
use crate::error::HostError;
use std::any::Any;
use std::sync::Arc;

/// Container-native session object
pub trait SessionHost: KeyValueBackend {
    /// Session identifier
    fn id(&self) -> &str;

    /// Whether the session has not been invalidated
    fn is_valid(&self) -> bool;

    /// Atomically read an attribute, inserting `init()` if absent
    fn get_or_insert_with(
        &self,
        key: &str,
        init: Box<dyn FnOnce() -> AttributeValue + '_>,
    ) -> AttributeValue;
}

/// Container-native request object
pub trait RequestHost: KeyValueBackend {
    /// Inbound request parameter
    fn parameter(&self, name: &str) -> Option<String>;

    /// Fetch the request's session, creating it when `create` is set
    ///
    /// # Errors
    /// Returns [`HostError::SessionCreationRefused`] when a session is needed
    /// but the container can no longer create one.
    fn session(&self, create: bool) -> Result<Option<Arc<dyn SessionHost>>, HostError>;

    /// Id of the session this request is bound to
    ///
    /// Unlike [`RequestHost::session`] this still answers while the session
    /// is being invalidated.
    fn session_id(&self) -> Option<String> {
        self.session(false)
            .ok()
            .flatten()
            .map(|session| session.id().to_string())
    }
}

/// Typed create-if-absent over a session attribute
///
/// Returns `None` if a value of another type already occupies `key`.
pub fn shared_attribute<T, F>(session: &dyn SessionHost, key: &str, init: F) -> Option<Arc<T>>
where
    T: Any + Send + Sync,
    F: FnOnce() -> T,
{
    let value = session.get_or_insert_with(key, Box::new(move || Arc::new(init()) as AttributeValue));
    value.downcast::<T>().ok()
}

/// Typed read of a session attribute
#[must_use]
pub fn typed_attribute<T, B>(backend: &B, key: &str) -> Option<Arc<T>>
where
    T: Any + Send + Sync,
    B: KeyValueBackend + ?Sized,
{
    backend.get(key).and_then(|value| value.downcast::<T>().ok())
}
