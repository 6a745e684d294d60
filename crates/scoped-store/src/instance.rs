//! Contextual instances
//!
//! A [`ContextualInstance`] pairs a live object with everything needed to
//! destroy it later: the [`Contextual`] definition that created it and the
//! [`CreationalContext`] collected while it was created.
//!
//! Instances are cheap to clone; clones share one destruction flag, so the
//! destruction callback runs at most once no matter how many stores or
//! threads reach the same instance.

use crate::error::{CreationError, DestructionError};
use crate::identifier::BeanIdentifier;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Type-erased live object
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Contextual definition supplied by the container
///
/// The core never decides creation policy; it only calls back into the
/// contextual to create on first demand and to destroy.
pub trait Contextual: Send + Sync + fmt::Debug {
    /// Identifier of this contextual within its scope
    fn identifier(&self) -> BeanIdentifier;

    /// Create a new instance
    ///
    /// # Errors
    /// Returns [`CreationError`] if the container cannot build the instance.
    fn create(&self, creational: &mut CreationalContext) -> Result<Instance, CreationError>;

    /// Destroy an instance previously returned by [`Contextual::create`]
    ///
    /// # Errors
    /// Returns [`DestructionError`] if the callback fails.
    fn destroy(
        &self,
        instance: &Instance,
        creational: &CreationalContext,
    ) -> Result<(), DestructionError>;
}

/// Creation metadata collected while an instance is built
#[derive(Debug, Default)]
pub struct CreationalContext {
    dependents: Vec<ContextualInstance>,
}

impl CreationalContext {
    /// Create empty creational context
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dependent instance, destroyed together with its owner
    pub fn push_dependent(&mut self, dependent: ContextualInstance) {
        self.dependents.push(dependent);
    }

    /// Dependent instances recorded so far
    #[inline]
    #[must_use]
    pub fn dependents(&self) -> &[ContextualInstance] {
        &self.dependents
    }

    fn release(&self) {
        for dependent in &self.dependents {
            if let Err(err) = dependent.destroy() {
                tracing::warn!("Failed to release dependent instance: {}", err);
            }
        }
    }
}

struct InstanceState {
    contextual: Arc<dyn Contextual>,
    instance: Instance,
    creational: CreationalContext,
    destroyed: AtomicBool,
}

/// Live instance plus its destruction handle
#[derive(Clone)]
pub struct ContextualInstance {
    state: Arc<InstanceState>,
}

impl ContextualInstance {
    /// Pair an instance with its contextual and creation metadata
    #[must_use]
    pub fn new(
        contextual: Arc<dyn Contextual>,
        instance: Instance,
        creational: CreationalContext,
    ) -> Self {
        Self {
            state: Arc::new(InstanceState {
                contextual,
                instance,
                creational,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier of the originating contextual
    #[inline]
    #[must_use]
    pub fn identifier(&self) -> BeanIdentifier {
        self.state.contextual.identifier()
    }

    /// The originating contextual
    #[inline]
    #[must_use]
    pub fn contextual(&self) -> &Arc<dyn Contextual> {
        &self.state.contextual
    }

    /// The live object
    #[inline]
    #[must_use]
    pub fn instance(&self) -> &Instance {
        &self.state.instance
    }

    /// Downcast the live object
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.state.instance).downcast::<T>().ok()
    }

    /// Whether the destruction callback already ran
    #[inline]
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same instance
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Run the destruction callback, then release dependents
    ///
    /// Returns `Ok(false)` when the instance was already destroyed.
    ///
    /// # Errors
    /// Propagates the callback's [`DestructionError`]; dependents are
    /// released regardless.
    pub fn destroy(&self) -> Result<bool, DestructionError> {
        if self.state.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = self
            .state
            .contextual
            .destroy(&self.state.instance, &self.state.creational);
        self.state.creational.release();
        result.map(|()| true)
    }
}

impl fmt::Debug for ContextualInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextualInstance")
            .field("contextual", &self.state.contextual)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct Counting {
        destroyed: AtomicUsize,
    }

    impl Contextual for Counting {
        fn identifier(&self) -> BeanIdentifier {
            BeanIdentifier::new("test.Counting")
        }

        fn create(&self, _creational: &mut CreationalContext) -> Result<Instance, CreationError> {
            Ok(Arc::new(7_u32))
        }

        fn destroy(
            &self,
            _instance: &Instance,
            _creational: &CreationalContext,
        ) -> Result<(), DestructionError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make(contextual: &Arc<Counting>) -> ContextualInstance {
        let mut creational = CreationalContext::new();
        let instance = contextual.create(&mut creational).unwrap();
        ContextualInstance::new(contextual.clone(), instance, creational)
    }

    #[test]
    fn destroy_runs_callback_once_across_clones() {
        let contextual = Arc::new(Counting::default());
        let instance = make(&contextual);
        let clone = instance.clone();

        assert!(instance.destroy().unwrap());
        assert!(!clone.destroy().unwrap());
        assert_eq!(contextual.destroyed.load(Ordering::SeqCst), 1);
        assert!(clone.is_destroyed());
    }

    #[test]
    fn dependents_released_with_owner() {
        let owner = Arc::new(Counting::default());
        let dependent = Arc::new(Counting::default());

        let mut creational = CreationalContext::new();
        creational.push_dependent(make(&dependent));
        let instance = ContextualInstance::new(owner.clone(), Arc::new(1_u8), creational);

        instance.destroy().unwrap();
        assert_eq!(dependent.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn downcast_to_concrete_type() {
        let contextual = Arc::new(Counting::default());
        let instance = make(&contextual);
        assert_eq!(*instance.downcast::<u32>().unwrap(), 7);
        assert!(instance.downcast::<String>().is_none());
    }
}
