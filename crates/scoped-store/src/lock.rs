//! Per-session lock store
//!
//! A [`LockStore`] maps string keys to mutex handles. One store lives in each
//! session (as a session attribute) and is shared by every concurrent request
//! on that session. It serializes creation of session-scoped instances and
//! access to long-running conversations.

use crate::backend::KeyValueBackend;
use crate::host::{shared_attribute, SessionHost};
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Session attribute under which the lock store lives
pub const LOCK_STORE_ATTRIBUTE: &str = "scoped.lock-store";

/// Held lock, released on drop
pub struct HeldLock {
    key: String,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl HeldLock {
    /// Key this lock guards
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock").field("key", &self.key).finish()
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        tracing::trace!(key = %self.key, "lock released");
    }
}

/// Lazily populated map from key to mutex handle
#[derive(Debug, Default)]
pub struct LockStore {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockStore {
    /// Create empty lock store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock store of a session, created at most once per session
    ///
    /// Creation goes through the session's atomic create-if-absent, so two
    /// racing requests always observe the same store.
    #[must_use]
    pub fn for_session(session: &dyn SessionHost) -> Option<Arc<Self>> {
        let store = shared_attribute(session, LOCK_STORE_ATTRIBUTE, Self::new);
        if store.is_none() {
            tracing::warn!(
                session = session.id(),
                "session attribute {} does not hold a lock store",
                LOCK_STORE_ATTRIBUTE
            );
        }
        store
    }

    /// Existing lock store of a backend, without creating one
    #[must_use]
    pub fn existing<B: KeyValueBackend + ?Sized>(backend: &B) -> Option<Arc<Self>> {
        crate::host::typed_attribute(backend, LOCK_STORE_ATTRIBUTE)
    }

    fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Block until the lock for `key` is held
    #[must_use]
    pub fn lock(&self, key: &str) -> HeldLock {
        let guard = self.handle(key).lock_arc();
        tracing::trace!(key, "lock acquired");
        HeldLock {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Try to take the lock for `key`, waiting at most `timeout`
    #[must_use]
    pub fn try_lock_for(&self, key: &str, timeout: Duration) -> Option<HeldLock> {
        let guard = self.handle(key).try_lock_arc_for(timeout)?;
        tracing::trace!(key, "lock acquired");
        Some(HeldLock {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Whether the lock for `key` is currently held by anyone
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.get(key).is_some_and(|lock| lock.is_locked())
    }

    /// Forget the handle for `key`
    ///
    /// Holders of the old handle keep it; the next lookup creates a fresh one.
    pub fn discard(&self, key: &str) {
        self.locks.remove(key);
    }

    /// Number of known handles
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no handle was ever created
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
