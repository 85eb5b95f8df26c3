//! Error types for the reconciler crate.

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Every gateway call returns one of these; the reconciler inspects the
/// variant to decide between absorbing the failure, requeueing, or handing it
/// back to the loop for backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Resource is absent from the store.
    #[error("constraint '{key}' not found")]
    NotFound { key: String },

    /// A write raced with another writer (stale resource version).
    #[error("conflict writing constraint '{key}': {reason}")]
    Conflict { key: String, reason: String },

    /// Any other resource store failure.
    #[error("resource store operation '{operation}' failed: {reason}")]
    StoreFailed { operation: String, reason: String },

    /// The policy engine rejected the rule or could not be reached.
    #[error("failed to register rule '{key}': {reason}")]
    RegistrationFailed { key: String, reason: String },

    /// The policy engine has no rule under this key.
    #[error("rule '{key}' is unknown to the policy engine")]
    UnknownRule { key: String },

    /// Any other policy engine failure.
    #[error("policy engine operation '{operation}' failed: {reason}")]
    EngineFailed { operation: String, reason: String },

    /// Metrics export failed.
    #[error("metrics report failed: {reason}")]
    MetricsFailed { reason: String },

    /// `spec.enforcementAction` is not a recognised action.
    #[error("invalid enforcement action: {value}")]
    InvalidEnforcementAction { value: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Loop was stopped.
    #[error("reconciliation loop stopped")]
    LoopStopped,
}

impl Error {
    /// Create a not found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a write conflict error.
    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a store failed error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a registration failed error.
    pub fn registration_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown rule error.
    pub fn unknown_rule(key: impl Into<String>) -> Self {
        Self::UnknownRule { key: key.into() }
    }

    /// Create an engine failed error.
    pub fn engine_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EngineFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a metrics failed error.
    pub fn metrics_failed(reason: impl Into<String>) -> Self {
        Self::MetricsFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid enforcement action error.
    pub fn invalid_enforcement_action(value: impl Into<String>) -> Self {
        Self::InvalidEnforcementAction {
            value: value.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// The collaborator's own message, without the variant prefix. This is
    /// what gets recorded in a constraint's status errors.
    pub fn detail(&self) -> String {
        match self {
            Self::Conflict { reason, .. }
            | Self::StoreFailed { reason, .. }
            | Self::RegistrationFailed { reason, .. }
            | Self::EngineFailed { reason, .. }
            | Self::MetricsFailed { reason }
            | Self::InvalidConfig { reason } => reason.clone(),
            Self::NotFound { .. }
            | Self::UnknownRule { .. }
            | Self::InvalidEnforcementAction { .. }
            | Self::LoopStopped => self.to_string(),
        }
    }

    /// Whether the resource was absent.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is an optimistic-concurrency conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the engine reported the rule as unknown.
    pub const fn is_unknown_rule(&self) -> bool {
        matches!(self, Self::UnknownRule { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::registration_failed("K/a", "bad rule");
        assert!(err.to_string().contains("K/a"));
        assert!(err.to_string().contains("bad rule"));
    }

    #[test]
    fn test_predicates() {
        assert!(Error::not_found("K/a").is_not_found());
        assert!(Error::conflict("K/a", "stale").is_conflict());
        assert!(Error::unknown_rule("K/a").is_unknown_rule());
        assert!(!Error::store_failed("get", "timeout").is_not_found());
    }

    #[test]
    fn test_detail_strips_prefix() {
        assert_eq!(Error::registration_failed("K/a", "bad rule").detail(), "bad rule");
        assert!(Error::unknown_rule("K/a").detail().contains("K/a"));
    }
}
