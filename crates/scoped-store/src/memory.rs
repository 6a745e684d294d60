//! In-memory request and session hosts
//!
//! Reference hosts for embedding and tests. Attribute bags are [`DashMap`]s,
//! so enumeration never blocks concurrent writers.

use crate::backend::{AttributeValue, KeyValueBackend};
use crate::error::{BackendError, HostError};
use crate::host::{RequestHost, SessionHost};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory session
#[derive(Debug)]
pub struct MemorySession {
    id: String,
    attributes: DashMap<String, AttributeValue>,
    valid: AtomicBool,
}

impl MemorySession {
    /// Create session with a random identifier
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Create session with a fixed identifier
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            attributes: DashMap::new(),
            valid: AtomicBool::new(true),
        })
    }

    /// Mark the session invalid; later writes are refused
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            tracing::debug!(session = %self.id, "session invalidated");
        }
    }

    /// Number of attributes currently stored
    #[must_use]
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }
}

impl KeyValueBackend for MemorySession {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        self.attributes.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        if !self.is_valid() {
            return Err(HostError::SessionInvalidated(self.id.clone()).into());
        }
        self.attributes.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.attributes.remove(key).map(|(_, value)| value)
    }

    fn keys(&self) -> Vec<String> {
        self.attributes.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl SessionHost for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn get_or_insert_with(
        &self,
        key: &str,
        init: Box<dyn FnOnce() -> AttributeValue + '_>,
    ) -> AttributeValue {
        self.attributes
            .entry(key.to_string())
            .or_insert_with(init)
            .value()
            .clone()
    }
}

/// In-memory request
#[derive(Debug, Default)]
pub struct MemoryRequest {
    attributes: DashMap<String, AttributeValue>,
    parameters: HashMap<String, String>,
    session: Mutex<Option<Arc<MemorySession>>>,
    committed: AtomicBool,
    sessions_created: AtomicUsize,
}

impl MemoryRequest {
    /// Create request without session or parameters
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With an inbound parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// With an existing session
    #[must_use]
    pub fn with_session(self, session: Arc<MemorySession>) -> Self {
        *self.session.lock() = Some(session);
        self
    }

    /// Commit the response; sessions can no longer be created
    pub fn commit(&self) {
        self.committed.store(true, Ordering::Release);
    }

    /// The request's current session, if any
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<MemorySession>> {
        self.session.lock().clone()
    }

    /// How many sessions this request created
    #[must_use]
    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::Acquire)
    }
}

impl KeyValueBackend for MemoryRequest {
    fn get(&self, key: &str) -> Option<AttributeValue> {
        self.attributes.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: &str, value: AttributeValue) -> Result<(), BackendError> {
        self.attributes.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.attributes.remove(key).map(|(_, value)| value)
    }

    fn keys(&self) -> Vec<String> {
        self.attributes.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl RequestHost for MemoryRequest {
    fn parameter(&self, name: &str) -> Option<String> {
        self.parameters.get(name).cloned()
    }

    fn session(&self, create: bool) -> Result<Option<Arc<dyn SessionHost>>, HostError> {
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref().filter(|s| s.is_valid()) {
            return Ok(Some(session.clone() as Arc<dyn SessionHost>));
        }
        if !create {
            return Ok(None);
        }
        if self.committed.load(Ordering::Acquire) {
            return Err(HostError::SessionCreationRefused(
                "response already committed".to_string(),
            ));
        }
        let session = MemorySession::new();
        self.sessions_created.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(session = %session.id(), "session created");
        *slot = Some(session.clone());
        Ok(Some(session as Arc<dyn SessionHost>))
    }

    fn session_id(&self) -> Option<String> {
        self.session.lock().as_ref().map(|session| session.id.clone())
    }
}
