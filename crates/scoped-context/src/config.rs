//! Context configuration and clocks

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default propagation parameter
pub const DEFAULT_PARAMETER_NAME: &str = "cid";

/// Default conversation timeout (10 minutes)
pub const DEFAULT_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Default bounded wait for a conversation lock
pub const DEFAULT_CONCURRENT_ACCESS_TIMEOUT_MS: u64 = 1000;

/// Which store backs the session context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStoreKind {
    /// Session created on first write
    #[default]
    Lazy,
    /// Lazy, with staged writes during session creation
    LazyCyclic,
}

/// Context configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Identifier of this deployment's contexts, part of every attribute key
    pub context_id: String,
    /// Parameter carrying the conversation id
    pub parameter_name: String,
    /// Timeout for new long-running conversations
    pub default_timeout_ms: u64,
    /// Bounded wait for a busy conversation lock
    pub concurrent_access_timeout_ms: u64,
    /// Resolve the conversation on first use instead of at activation
    pub lazy_conversation_context: bool,
    /// Store variant of the session context
    pub session_store: SessionStoreKind,
    /// Sweep expired conversations when a conversation context deactivates
    pub reap_expired_on_deactivate: bool,
}

impl ContextConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML, filling omitted fields with defaults
    ///
    /// # Errors
    /// Returns [`ConfigError`] on malformed TOML or invalid values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parameter_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "parameter_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.context_id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "context_id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "default_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// With context identifier
    #[inline]
    #[must_use]
    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = context_id.into();
        self
    }

    /// With propagation parameter name
    #[inline]
    #[must_use]
    pub fn with_parameter_name(mut self, name: impl Into<String>) -> Self {
        self.parameter_name = name.into();
        self
    }

    /// With conversation timeout
    #[inline]
    #[must_use]
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// With bounded lock wait
    #[inline]
    #[must_use]
    pub fn with_concurrent_access_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.concurrent_access_timeout_ms = timeout_ms;
        self
    }

    /// With lazy conversation activation
    #[inline]
    #[must_use]
    pub fn with_lazy_conversation_context(mut self, lazy: bool) -> Self {
        self.lazy_conversation_context = lazy;
        self
    }

    /// With session store variant
    #[inline]
    #[must_use]
    pub fn with_session_store(mut self, kind: SessionStoreKind) -> Self {
        self.session_store = kind;
        self
    }

    /// With or without the expiry sweep at conversation deactivation
    #[inline]
    #[must_use]
    pub fn with_reap_expired_on_deactivate(mut self, reap: bool) -> Self {
        self.reap_expired_on_deactivate = reap;
        self
    }

    /// Bounded lock wait as a duration
    #[inline]
    #[must_use]
    pub fn concurrent_access_timeout(&self) -> Duration {
        Duration::from_millis(self.concurrent_access_timeout_ms)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_id: "main".to_string(),
            parameter_name: DEFAULT_PARAMETER_NAME.to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            concurrent_access_timeout_ms: DEFAULT_CONCURRENT_ACCESS_TIMEOUT_MS,
            lazy_conversation_context: false,
            session_store: SessionStoreKind::default(),
            reap_expired_on_deactivate: true,
        }
    }
}

/// Millisecond time source for conversation timeouts
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since an arbitrary fixed epoch
    fn now_ms(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Clock advanced by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create clock reading `start_ms`
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ContextConfig::new();
        assert_eq!(config.parameter_name, "cid");
        assert_eq!(config.default_timeout_ms, 600_000);
        assert_eq!(config.concurrent_access_timeout(), Duration::from_secs(1));
        assert_eq!(config.session_store, SessionStoreKind::Lazy);
        assert!(config.reap_expired_on_deactivate);
        assert!(!config.lazy_conversation_context);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = ContextConfig::from_toml_str(
            r#"
            parameter_name = "conversation"
            concurrent_access_timeout_ms = 50
            session_store = "lazy-cyclic"
            "#,
        )
        .unwrap();
        assert_eq!(config.parameter_name, "conversation");
        assert_eq!(config.concurrent_access_timeout_ms, 50);
        assert_eq!(config.session_store, SessionStoreKind::LazyCyclic);
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn empty_parameter_name_rejected() {
        let err = ContextConfig::from_toml_str("parameter_name = \"\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "parameter_name", .. }));
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(5);
        assert_eq!(clock.now_ms(), 105);
        clock.set(1);
        assert_eq!(clock.now_ms(), 1);
    }
}
