//! Bean stores
//!
//! A [`BeanStore`] maps [`BeanIdentifier`]s to [`ContextualInstance`]s.
//! [`BoundBeanStore`] adds attach/detach and per-bean locking for stores that
//! live on top of container storage.
//!
//! The concrete stores are all [`AttributeBeanStore`] over different
//! backends:
//!
//! - [`RequestBeanStore`]: request attributes, always attached
//! - [`EagerSessionBeanStore`]: a session that already exists
//! - [`LazySessionBeanStore`]: a session created on first write only
//! - [`LazyCyclicSessionBeanStore`]: lazy, and tolerates writes that re-enter
//!   the store while the session is being created

mod attribute;
mod request;
mod session;

pub use attribute::AttributeBeanStore;
pub use request::{RequestAttributes, RequestBeanStore};
pub use session::{
    EagerSessionBeanStore, LazyCyclicSessionBackend, LazyCyclicSessionBeanStore,
    LazySessionBackend, LazySessionBeanStore, SessionAttributes, SessionCreationListener,
    StagingScope,
};

use crate::identifier::BeanIdentifier;
use crate::instance::ContextualInstance;
use crate::lock::HeldLock;

/// Keyed storage of contextual instances
pub trait BeanStore {
    /// Stored instance, if any; never creates
    fn get(&mut self, id: &BeanIdentifier) -> Option<ContextualInstance>;

    /// Store an instance, replacing any previous one
    fn put(&mut self, id: BeanIdentifier, instance: ContextualInstance);

    /// Remove and return an instance
    fn remove(&mut self, id: &BeanIdentifier) -> Option<ContextualInstance>;

    /// Remove every instance owned by this store
    fn clear(&mut self);

    /// Identifiers currently present
    ///
    /// Every call starts a fresh scan.
    fn keys(&self) -> Box<dyn Iterator<Item = BeanIdentifier> + '_>;

    /// Whether an identifier is present
    fn contains(&mut self, id: &BeanIdentifier) -> bool {
        self.get(id).is_some()
    }
}

/// Bean store bound to container storage for one unit of work
pub trait BoundBeanStore: BeanStore + Send {
    /// Attach to the backing storage, pushing local state into it
    ///
    /// Returns `false` if the store does not support attaching, is already
    /// attached, or the storage refused the writes.
    fn attach(&mut self) -> bool;

    /// Detach from the backing storage, keeping a local snapshot
    ///
    /// Returns `false` if the store does not support detaching or is not
    /// attached.
    fn detach(&mut self) -> bool;

    /// Whether reads and writes currently reach the backing storage
    fn is_attached(&self) -> bool;

    /// Take the creation lock for an identifier
    ///
    /// `None` when the backing storage is not shared between threads.
    fn lock(&self, id: &BeanIdentifier) -> Option<HeldLock>;
}
