//! Error types for port operations.
//!
//! Every port method returns `Result<_, PortsError>`. Collaborators map their
//! internal errors into these variants so the engine can classify failures
//! (deadline vs. anything else) without inspecting messages.

use std::time::Duration;

use donflow_limits::LimitError;

/// Error type for all port operations.
#[derive(Debug, thiserror::Error)]
pub enum PortsError {
    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity (e.g. "trigger capability", "node").
        entity: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// A capability rejected or failed a call.
    #[error("capability {id} failed: {message}")]
    Capability {
        /// Capability ID.
        id: String,
        /// Failure description.
        message: String,
    },

    /// The workflow module failed outside of its in-band error channel.
    #[error("module error: {0}")]
    Module(String),

    /// The operation is not permitted in the current phase.
    #[error("{0}")]
    Disallowed(String),

    /// A quota rejected the operation.
    #[error(transparent)]
    Limit(#[from] LimitError),

    /// Operation exceeded its timeout.
    #[error("timeout: {operation} after {duration:?}")]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// How long was waited before giving up.
        duration: Duration,
    },

    /// The surrounding engine shut down.
    #[error("cancelled")]
    Cancelled,

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Catch-all internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PortsError {
    /// Convenience constructor for [`PortsError::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Convenience constructor for [`PortsError::Capability`].
    pub fn capability(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capability {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`PortsError::Timeout`].
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Whether the error is a deadline expiry, from a port or a time limiter.
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Limit(err) => err.is_timeout(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for PortsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
