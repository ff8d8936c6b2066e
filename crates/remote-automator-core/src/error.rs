//! Error types surfaced to operation handlers.

use std::fmt;

use thiserror::Error;

/// Configuration layer a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    /// Process environment snapshot.
    Environment,
    /// Per-call caller overrides.
    Overrides,
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Environment => "environment",
            Self::Overrides => "overrides",
        })
    }
}

/// Invalid or incomplete connection configuration.
///
/// Always recoverable by supplying better input; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error(
        "connect mode requires `wsEndpoint`: pass `wsEndpoint` in the overrides or set AUTOMATOR_WS_ENDPOINT"
    )]
    MissingWsEndpoint,
    #[error(
        "launch mode requires `projectPath`: pass `projectPath` in the overrides, or set `wsEndpoint`/AUTOMATOR_MODE=connect to attach instead"
    )]
    MissingProjectPath,
    #[error("invalid {layer} value for `{field}`: {reason}")]
    InvalidField {
        layer: ConfigLayer,
        field: &'static str,
        reason: String,
    },
    #[error("invalid overrides: {0}")]
    InvalidOverrides(String),
}

impl ConfigurationError {
    pub(crate) fn invalid(layer: ConfigLayer, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            layer,
            field,
            reason: reason.into(),
        }
    }
}

/// Session lifecycle error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to connect to automation target at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("failed to launch automation target for project {project_path}: {reason}")]
    Launch { project_path: String, reason: String },
    #[error("no active page: the navigation stack is empty")]
    NoPage,
    #[error("automation target error: {0}")]
    Target(String),
}

impl SessionError {
    /// Whether this error was caused by configuration input.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
