//! Key/value backends
//!
//! [`KeyValueBackend`] is the narrow capability set every bean store is built
//! on: get, put, remove and key enumeration over string keys. Request and
//! session attribute bags implement it directly; the lazy and cyclic session
//! backends are decorators over it.

use crate::error::BackendError;
use crate::lock::LockStore;
use std::any::Any;
use std::sync::Arc;

/// Type-erased attribute value
pub type AttributeValue = Arc<dyn Any + Send + Sync>;

/// Raw string-keyed attribute storage
pub trait KeyValueBackend: Send + Sync {
    /// Read an attribute
    fn get(&self, key: &str) -> Option<AttributeValue>;

    /// Write an attribute
    ///
    /// # Errors
    /// Returns [`BackendError::Unavailable`] when the storage cannot
    /// currently accept writes.
    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError>;

    /// Remove an attribute, returning the previous value
    fn remove(&self, key: &str) -> Option<AttributeValue>;

    /// Snapshot of the attribute names currently present
    ///
    /// The snapshot must be safe to iterate while other threads mutate the
    /// storage.
    fn keys(&self) -> Vec<String>;
}

/// Store-level properties of a backend
///
/// Kept apart from [`KeyValueBackend`] so the raw storage contract stays
/// narrow.
pub trait AttributeBacking: KeyValueBackend {
    /// Whether stores over this backend support attach/detach
    const DETACHABLE: bool = true;

    /// Lock store guarding concurrent creation, if the storage is shared
    /// between threads
    fn lock_store(&self) -> Option<Arc<LockStore>> {
        None
    }
}

impl<B: KeyValueBackend + ?Sized> KeyValueBackend for Arc<B> {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        (**self).put(key, value)
    }

    fn remove(&self, key: &str) -> Option<AttributeValue> {
        (**self).remove(key)
    }

    fn keys(&self) -> Vec<String> {
        (**self).keys()
    }
}
