use super::{BeanStore, BoundBeanStore};
use crate::backend::{AttributeBacking, AttributeValue};
use crate::identifier::BeanIdentifier;
use crate::instance::ContextualInstance;
use crate::lock::HeldLock;
use crate::naming::NamingScheme;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Bean store over a string-keyed attribute backend
///
/// Instances are written under [`NamingScheme::prefix`]. While attached the
/// backend is authoritative; while detached the store serves a local
/// snapshot taken at detach time plus any writes made since.
///
/// A write the backend refuses is logged at trace level and the store
/// detaches itself, so later operations only touch local state.
#[derive(Debug)]
pub struct AttributeBeanStore<B> {
    scheme: NamingScheme,
    backend: B,
    local: BTreeMap<BeanIdentifier, ContextualInstance>,
    attached: bool,
}

impl<B: AttributeBacking> AttributeBeanStore<B> {
    /// Create detached store over a backend
    ///
    /// Stores over non-detachable backends are attached from the start.
    #[must_use]
    pub fn with_backend(scheme: NamingScheme, backend: B) -> Self {
        Self {
            scheme,
            backend,
            local: BTreeMap::new(),
            attached: !B::DETACHABLE,
        }
    }

    /// Naming scheme of this store
    #[inline]
    #[must_use]
    pub fn scheme(&self) -> &NamingScheme {
        &self.scheme
    }

    /// The backing storage
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn fetch(&self, id: &BeanIdentifier) -> Option<ContextualInstance> {
        self.backend
            .get(&self.scheme.prefix(id))
            .and_then(from_attribute)
    }
}

impl<B: AttributeBacking> BeanStore for AttributeBeanStore<B> {
    fn get(&mut self, id: &BeanIdentifier) -> Option<ContextualInstance> {
        if !self.attached {
            return self.local.get(id).cloned();
        }
        match self.fetch(id) {
            Some(instance) => {
                self.local.insert(id.clone(), instance.clone());
                Some(instance)
            }
            None => {
                self.local.remove(id);
                None
            }
        }
    }

    fn put(&mut self, id: BeanIdentifier, instance: ContextualInstance) {
        let key = self.scheme.prefix(&id);
        if self.attached {
            if let Err(err) = self.backend.put(&key, to_attribute(&instance)) {
                tracing::trace!(key = %key, %err, "attribute not stored");
                if B::DETACHABLE {
                    self.attached = false;
                }
            } else {
                tracing::trace!(key = %key, "bean store put");
            }
        }
        self.local.insert(id, instance);
    }

    fn remove(&mut self, id: &BeanIdentifier) -> Option<ContextualInstance> {
        let local = self.local.remove(id);
        if !self.attached {
            return local;
        }
        let key = self.scheme.prefix(id);
        let removed = self.backend.remove(&key).and_then(from_attribute);
        tracing::trace!(key = %key, "bean store remove");
        removed.or(local)
    }

    fn clear(&mut self) {
        if self.attached {
            for name in self.backend.keys() {
                if self.scheme.accepts(&name) {
                    self.backend.remove(&name);
                }
            }
        }
        self.local.clear();
        tracing::trace!(scheme = %self.scheme, "bean store cleared");
    }

    fn keys(&self) -> Box<dyn Iterator<Item = BeanIdentifier> + '_> {
        if self.attached {
            Box::new(self.scheme.filter_ids(self.backend.keys()))
        } else {
            Box::new(self.local.keys().cloned())
        }
    }
}

impl<B: AttributeBacking> BoundBeanStore for AttributeBeanStore<B> {
    fn attach(&mut self) -> bool {
        if !B::DETACHABLE || self.attached {
            return false;
        }
        for (id, instance) in &self.local {
            let key = self.scheme.prefix(id);
            if let Err(err) = self.backend.put(&key, to_attribute(instance)) {
                tracing::trace!(key = %key, %err, "attribute not stored, store stays detached");
                return false;
            }
        }
        self.attached = true;
        tracing::trace!(scheme = %self.scheme, entries = self.local.len(), "bean store attached");
        true
    }

    fn detach(&mut self) -> bool {
        if !B::DETACHABLE || !self.attached {
            return false;
        }
        for name in self.backend.keys() {
            let Some(id) = self.scheme.deprefix(&name) else {
                continue;
            };
            if let Some(instance) = self.backend.get(&name).and_then(from_attribute) {
                self.local.insert(id, instance);
            }
        }
        self.attached = false;
        tracing::trace!(scheme = %self.scheme, entries = self.local.len(), "bean store detached");
        true
    }

    fn is_attached(&self) -> bool {
        self.attached
    }

    fn lock(&self, id: &BeanIdentifier) -> Option<HeldLock> {
        let locks = self.backend.lock_store()?;
        Some(locks.lock(&self.scheme.prefix(id)))
    }
}

pub(crate) fn to_attribute(instance: &ContextualInstance) -> AttributeValue {
    Arc::new(instance.clone())
}

pub(crate) fn from_attribute(value: AttributeValue) -> Option<ContextualInstance> {
    value
        .downcast::<ContextualInstance>()
        .ok()
        .map(|instance| (*instance).clone())
}
