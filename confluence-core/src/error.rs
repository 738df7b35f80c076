//! Error types for graph execution.
//!
//! Every failure inside a graph travels over the reserved `"error"` channel as a
//! [`FlowError`]. Producers report their own failures as [`FlowError::Failed`];
//! the remaining variants describe misuse of the orchestrator itself.

use serde_json::Value;
use thiserror::Error;

/// Result type alias using [`FlowError`].
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors that can flow through a graph or a completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// A producer reported a failure.
    #[error("{0}")]
    Failed(String),

    /// A name was resolved a second time within the same graph.
    #[error("name `{0}` was already resolved")]
    AlreadyResolved(String),

    /// Every handle to a completion was dropped before it fired.
    #[error("completion dropped before it fired")]
    Abandoned,

    /// A setter was invoked by a name that was never installed.
    #[error("unknown setter `{0}`")]
    UnknownSetter(String),

    /// A throttle was opened with a capacity of zero.
    #[error("throttle capacity must be at least 1")]
    InvalidCapacity,

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FlowError {
    /// Wrap anything printable as a producer failure.
    pub fn wrap(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }

    /// Wrap a JSON error payload. Strings are taken verbatim, anything else is
    /// rendered as compact JSON.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::Failed(message.clone()),
            other => Self::Failed(other.to_string()),
        }
    }

    /// The message carried by a producer failure, if this is one.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failed(message) => Some(message),
            _ => None,
        }
    }
}

impl From<String> for FlowError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for FlowError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_owned())
    }
}
