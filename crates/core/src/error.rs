//! Error types for identifier parsing.

use thiserror::Error;

/// Errors raised while parsing or validating core identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A workflow ID was not 32 bytes of hex.
    #[error("invalid workflowID {value:?}: {reason}")]
    InvalidWorkflowId {
        /// Rejected input
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A workflow owner was not a 20-byte hex address.
    #[error("invalid workflowOwner {value:?}: {reason}")]
    InvalidWorkflowOwner {
        /// Rejected input
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

impl CoreError {
    /// Create an invalid workflow ID error
    pub fn invalid_workflow_id(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWorkflowId {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid workflow owner error
    pub fn invalid_workflow_owner(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWorkflowOwner {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
