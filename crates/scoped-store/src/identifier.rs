//! Bean identifiers
//!
//! A [`BeanIdentifier`] names one contextual type within a scope. Identifiers
//! are stable for the lifetime of a deployment and are the keys of every
//! bean store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, serializable, totally ordered key of a contextual instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeanIdentifier(String);

impl BeanIdentifier {
    /// Create identifier from its string form
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form of the identifier
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BeanIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BeanIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BeanIdentifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for BeanIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_ordered_by_string_form() {
        let a = BeanIdentifier::from("a.Cart");
        let b = BeanIdentifier::from("b.Basket");
        assert!(a < b);
        assert_eq!(a.to_string(), "a.Cart");
    }

    #[test]
    fn identifier_conversions_agree() {
        let owned = BeanIdentifier::from(String::from("shop.Cart"));
        assert_eq!(owned, BeanIdentifier::new("shop.Cart"));
        assert_eq!(owned.as_ref(), "shop.Cart");
    }
}
