//! Error types for scoped stores
//!
//! Store-level failures are deliberately narrow: a backing storage that
//! refuses a write is reported as [`BackendError`] and recovered by the store,
//! never surfaced as a fatal condition.

/// Backing attribute storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Storage cannot currently accept writes
    #[error("attribute storage unavailable: {0}")]
    Unavailable(String),
}

impl From<HostError> for BackendError {
    fn from(err: HostError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Errors raised by request/session host objects
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The container refused to create a session (e.g. response committed)
    #[error("session creation refused: {0}")]
    SessionCreationRefused(String),

    /// The session has already been invalidated
    #[error("session {0} has been invalidated")]
    SessionInvalidated(String),
}

/// Contextual instance creation failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to create {bean}: {reason}")]
pub struct CreationError {
    /// Bean being created
    pub bean: String,
    /// Failure description
    pub reason: String,
}

impl CreationError {
    /// Create new creation error
    #[inline]
    pub fn new(bean: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            bean: bean.into(),
            reason: reason.into(),
        }
    }
}

/// A destruction callback failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to destroy {bean}: {reason}")]
pub struct DestructionError {
    /// Bean being destroyed
    pub bean: String,
    /// Failure description
    pub reason: String,
}

impl DestructionError {
    /// Create new destruction error
    #[inline]
    pub fn new(bean: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            bean: bean.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_error_converts_to_unavailable_backend() {
        let err: BackendError = HostError::SessionCreationRefused("committed".into()).into();
        assert!(matches!(err, BackendError::Unavailable(ref msg) if msg.contains("committed")));
    }

    #[test]
    fn destruction_error_display() {
        let err = DestructionError::new("shop.Cart", "boom");
        assert_eq!(err.to_string(), "failed to destroy shop.Cart: boom");
    }
}
