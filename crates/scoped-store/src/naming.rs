//! Naming schemes for attribute keys
//!
//! A [`NamingScheme`] maps `(scope type, context id)` to a key prefix. Every
//! store writes its instances under `prefix + identifier`, which lets several
//! scopes share one attribute bag without ever reading each other's keys.
//!
//! Both components are escaped before they are joined, so the prefix is
//! injective: for two distinct schemes neither prefix is a prefix of the
//! other.

use crate::identifier::BeanIdentifier;
use std::fmt;

const DELIMITER: char = '#';
const ESCAPE: char = '\\';

/// Pure value deriving collision-free attribute keys
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamingScheme {
    key_prefix: String,
}

impl NamingScheme {
    /// Create naming scheme for a scope type and contextual identifier
    #[must_use]
    pub fn new(scope_type: &str, context_id: &str) -> Self {
        let mut key_prefix = String::with_capacity(scope_type.len() + context_id.len() + 2);
        escape_into(&mut key_prefix, scope_type);
        key_prefix.push(DELIMITER);
        escape_into(&mut key_prefix, context_id);
        key_prefix.push(DELIMITER);
        Self { key_prefix }
    }

    /// Scheme nested one level below this one
    ///
    /// Escaped like the other components. The child's keys fall inside this
    /// scheme's key space, so a scheme with children holds no instances itself.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let mut key_prefix = String::with_capacity(self.key_prefix.len() + name.len() + 1);
        key_prefix.push_str(&self.key_prefix);
        escape_into(&mut key_prefix, name);
        key_prefix.push(DELIMITER);
        Self { key_prefix }
    }

    /// Storage key for an identifier
    #[must_use]
    pub fn prefix(&self, id: &BeanIdentifier) -> String {
        let mut key = String::with_capacity(self.key_prefix.len() + id.as_str().len());
        key.push_str(&self.key_prefix);
        key.push_str(id.as_str());
        key
    }

    /// The shared prefix of every key this scheme produces
    #[inline]
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Whether an attribute name belongs to this scheme
    #[inline]
    #[must_use]
    pub fn accepts(&self, name: &str) -> bool {
        name.starts_with(&self.key_prefix)
    }

    /// Strip the prefix from an attribute name owned by this scheme
    #[must_use]
    pub fn deprefix(&self, name: &str) -> Option<BeanIdentifier> {
        name.strip_prefix(&self.key_prefix).map(BeanIdentifier::new)
    }

    /// Filter attribute names down to the identifiers owned by this scheme
    pub fn filter_ids<'a, I>(&'a self, names: I) -> impl Iterator<Item = BeanIdentifier> + 'a
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: 'a,
    {
        names.into_iter().filter_map(move |name| self.deprefix(&name))
    }
}

impl fmt::Display for NamingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_prefix)
    }
}

fn escape_into(out: &mut String, component: &str) {
    for ch in component.chars() {
        if ch == DELIMITER || ch == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(ch);
    }
}
