//! Error types for scoped contexts

use crate::context::ScopeType;
use scoped_store::CreationError;

/// Main error type for context operations
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Get or create attempted while the context is inactive
    #[error("{0} context is not active")]
    NotActive(ScopeType),

    /// Operation needs an associated unit of work
    #[error("{0} context is not associated with a request")]
    NotAssociated(ScopeType),

    /// The context has no bean store to create into
    #[error("{0} context has no bean store")]
    NoBeanStore(ScopeType),

    /// The contextual failed to create its instance
    #[error(transparent)]
    Creation(#[from] CreationError),

    /// Conversation condition
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

impl ContextError {
    /// Check if this is a context-not-active error
    #[must_use]
    pub fn is_not_active(&self) -> bool {
        matches!(self, Self::NotActive(_))
    }

    /// Check if this is a busy-conversation condition
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Conversation(err) if err.is_busy())
    }

    /// Check if this is a nonexistent-conversation condition
    #[must_use]
    pub fn is_nonexistent(&self) -> bool {
        matches!(self, Self::Conversation(err) if err.is_nonexistent())
    }
}

/// Conversation conditions
///
/// Cloneable so a lazily initialized context can raise the same condition
/// on every access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    /// The conversation exists but another request holds its lock
    #[error("conversation {id} is busy, lock not acquired within {waited_ms}ms")]
    Busy {
        /// Propagated conversation id
        id: String,
        /// Bounded wait that elapsed
        waited_ms: u64,
    },

    /// No long-running conversation with this id (expired, ended, unknown)
    #[error("no conversation found to restore for id {0}")]
    Nonexistent(String),

    /// `begin` on a conversation that is already long-running
    #[error("conversation {0} is already long-running")]
    AlreadyLongRunning(String),

    /// `end` on a transient conversation
    #[error("conversation is not long-running")]
    NotLongRunning,

    /// `begin` with an id another conversation already uses
    #[error("conversation id {0} is already in use")]
    IdInUse(String),

    /// A session is required but could not be obtained
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),
}

impl ConversationError {
    /// Check if this is the busy condition
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Check if this is the nonexistent condition
    #[inline]
    #[must_use]
    pub fn is_nonexistent(&self) -> bool {
        matches!(self, Self::Nonexistent(_))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Result type alias for context operations
pub type Result<T> = std::result::Result<T, ContextError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_conditions_are_classified() {
        let busy: ContextError = ConversationError::Busy {
            id: "1".into(),
            waited_ms: 1000,
        }
        .into();
        assert!(busy.is_busy());
        assert!(!busy.is_nonexistent());

        let gone: ContextError = ConversationError::Nonexistent("1".into()).into();
        assert!(gone.is_nonexistent());
        assert!(!ContextError::NotActive(ScopeType::Request).is_busy());
    }

    #[test]
    fn busy_message_names_conversation() {
        let err = ConversationError::Busy {
            id: "7".into(),
            waited_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "conversation 7 is busy, lock not acquired within 250ms"
        );
    }
}
