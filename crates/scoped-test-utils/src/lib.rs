//! Testing utilities for the scoped contexts workspace
//!
//! Shared contextuals, listeners, and helpers.

#![allow(missing_docs)]

use parking_lot::Mutex;
use scoped_store::{
    BeanIdentifier, Contextual, ContextualInstance, CreationError, CreationalContext,
    DestructionError, Instance, SessionCreationListener, SessionHost, StagingScope,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared log of destruction callbacks, in call order
pub type DestructionLog = Arc<Mutex<Vec<BeanIdentifier>>>;

/// Contextual that counts creations and destructions
#[derive(Debug)]
pub struct RecordingContextual {
    id: BeanIdentifier,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_destroy: AtomicBool,
    panic_on_destroy: AtomicBool,
    log: Option<DestructionLog>,
}

impl RecordingContextual {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, None))
    }

    pub fn logged(id: &str, log: &DestructionLog) -> Arc<Self> {
        Arc::new(Self::build(id, Some(Arc::clone(log))))
    }

    /// Destruction callback returns an error
    pub fn failing(id: &str) -> Arc<Self> {
        let contextual = Self::build(id, None);
        contextual.fail_destroy.store(true, Ordering::SeqCst);
        Arc::new(contextual)
    }

    /// Destruction callback panics
    pub fn panicking(id: &str) -> Arc<Self> {
        let contextual = Self::build(id, None);
        contextual.panic_on_destroy.store(true, Ordering::SeqCst);
        Arc::new(contextual)
    }

    fn build(id: &str, log: Option<DestructionLog>) -> Self {
        Self {
            id: BeanIdentifier::new(id),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            fail_destroy: AtomicBool::new(false),
            panic_on_destroy: AtomicBool::new(false),
            log,
        }
    }

    pub fn id(&self) -> &BeanIdentifier {
        &self.id
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Contextual for RecordingContextual {
    fn identifier(&self) -> BeanIdentifier {
        self.id.clone()
    }

    fn create(&self, _creational: &mut CreationalContext) -> Result<Instance, CreationError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(format!("{}#{}", self.id, n)))
    }

    fn destroy(
        &self,
        _instance: &Instance,
        _creational: &CreationalContext,
    ) -> Result<(), DestructionError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.lock().push(self.id.clone());
        }
        if self.panic_on_destroy.load(Ordering::SeqCst) {
            panic!("destroy callback for {} panicked", self.id);
        }
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(DestructionError::new(self.id.as_str(), "refused"));
        }
        Ok(())
    }
}

/// Create an instance through the contextual's own create callback
pub fn instance_of(contextual: &Arc<RecordingContextual>) -> ContextualInstance {
    let mut creational = CreationalContext::new();
    let instance = contextual.create(&mut creational).unwrap();
    ContextualInstance::new(contextual.clone(), instance, creational)
}

/// Listener that stages one more instance when the session is created
#[derive(Debug)]
pub struct StagingListener {
    contextual: Arc<RecordingContextual>,
    calls: AtomicUsize,
}

impl StagingListener {
    pub fn new(contextual: Arc<RecordingContextual>) -> Arc<Self> {
        Arc::new(Self {
            contextual,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SessionCreationListener for StagingListener {
    fn session_created(&self, _session: &dyn SessionHost, staging: &mut StagingScope<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let instance = instance_of(&self.contextual);
        staging.put(self.contextual.id(), &instance);
    }
}

pub fn new_log() -> DestructionLog {
    Arc::new(Mutex::new(Vec::new()))
}
