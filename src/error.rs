use thiserror::Error;

use crate::config::LoadError;

/// Errors surfaced through the read channel of resources and primitives.
///
/// Cloneable so a failed cache entry can re-raise the same error on every
/// subsequent read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invariant violated: {message}")]
    Invariant { message: String },
    #[error("network request for `{operation}` failed: {message}")]
    Network { operation: String, message: String },
    #[error("missing required field `{path}` in `{owner}`")]
    MissingRequiredField { owner: String, path: String },
    #[error("field error at `{path}` in `{owner}`: {message}")]
    FieldError {
        owner: String,
        path: String,
        message: String,
    },
    #[error("invalid configuration for `{key}`: {reason}")]
    Configuration { key: &'static str, reason: String },
}

impl RelayError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn configuration(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key,
            reason: reason.into(),
        }
    }
}

/// Failures while bootstrapping settings and telemetry.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InitError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
