//! Error taxonomy for configuration loading, tagging and policy resolution.

use thiserror::Error;

/// Errors raised while loading configuration, tagging resources or
/// resolving a policy set.
///
/// Configuration and invariant errors abort the whole run. Tag errors are
/// fatal only for the tagging call that raised them. Compliance findings are
/// never errors; they live in [`crate::compliance::ComplianceReport`].
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Malformed or incomplete input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The tag key is not part of the taxonomy (or not yet defined).
    #[error("unknown tag key '{0}'")]
    UnknownTagKey(String),

    /// The value is outside the tag's allowed set.
    #[error("invalid value '{value}' for tag '{key}' (allowed: {allowed:?})")]
    InvalidTagValue {
        key: String,
        value: String,
        allowed: Vec<String>,
    },

    /// A tagged resource is missing one of the mandatory tags.
    #[error("resource '{resource}' is missing required tag '{key}'")]
    MissingRequiredTag { resource: String, key: String },

    /// The resolved policy set is structurally broken. This is a resolver
    /// bug, not a policy failure.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Compliance gating stopped a deployment before any change was applied.
    #[error("environment '{environment}' failed compliance checks: {}", checks.join(", "))]
    NonCompliant {
        environment: String,
        checks: Vec<String>,
    },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernanceError {
    pub fn config(message: impl Into<String>) -> Self {
        GovernanceError::Configuration(message.into())
    }
}

/// Result alias for governance operations.
pub type Result<T> = std::result::Result<T, GovernanceError>;
