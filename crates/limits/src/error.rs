//! Error types for limiter operations

use std::fmt;
use std::time::Duration;

use donflow_core::Scope;
use thiserror::Error;

/// Errors raised by limiters and the limiter factory
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// A scalar quantity exceeded its bound
    #[error("{key} limited for {scope}[{tenant}]: cannot use {amount}, limit is {limit}")]
    BoundExceeded {
        /// Setting key
        key: String,
        /// Scope the bound applies at
        scope: Scope,
        /// Tenant key (empty for global)
        tenant: String,
        /// Configured bound
        limit: u64,
        /// Requested amount
        amount: u64,
    },

    /// A time-bounded operation did not finish before its deadline
    #[error("{key} exceeded: operation timed out after {duration:?}")]
    Timeout {
        /// Setting key
        key: String,
        /// Deadline that was exceeded
        duration: Duration,
    },

    /// No units left in a resource pool
    #[error("{key} limited for {scope}[{tenant}]: all {limit} units in use")]
    ResourceExhausted {
        /// Setting key
        key: String,
        /// Scope of the exhausted pool
        scope: Scope,
        /// Tenant key (empty for global)
        tenant: String,
        /// Pool size
        limit: u64,
    },

    /// A bounded queue is at capacity
    #[error("{key} limited: queue full ({capacity} elements)")]
    QueueFull {
        /// Setting key
        key: String,
        /// Queue capacity
        capacity: usize,
    },

    /// A rate limit rejected the request
    #[error("{key} limited for {scope}[{tenant}]: rate exceeded")]
    RateLimited {
        /// Setting key
        key: String,
        /// Scope of the rejecting bucket
        scope: Scope,
        /// Tenant key (empty for global)
        tenant: String,
    },

    /// The limiter has been closed
    #[error("{key} limiter is closed")]
    Closed {
        /// Setting key
        key: String,
    },

    /// A setting or override could not be turned into a limiter
    #[error("invalid setting {key}: {message}")]
    InvalidSetting {
        /// Setting key
        key: String,
        /// What was wrong
        message: String,
    },

    /// Several limiters failed, e.g. while closing a limiter set
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<LimitError>),
}

struct JoinedErrors<'a>(&'a [LimitError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl LimitError {
    /// Scope of a quota rejection, if this error is one
    #[must_use]
    pub fn scope(&self) -> Option<Scope> {
        match self {
            Self::BoundExceeded { scope, .. }
            | Self::ResourceExhausted { scope, .. }
            | Self::RateLimited { scope, .. } => Some(*scope),
            _ => None,
        }
    }

    /// Whether the error is a deadline expiry
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Create a timeout error
    pub fn timeout(key: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            key: key.into(),
            duration,
        }
    }

    /// Create a closed error
    pub fn closed(key: impl Into<String>) -> Self {
        Self::Closed { key: key.into() }
    }

    /// Create an invalid setting error
    pub fn invalid_setting(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Fold a list of errors: `Ok` when empty, the error itself when single.
    pub fn join(mut errors: Vec<Self>) -> LimitResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

/// Result type for limiter operations
pub type LimitResult<T> = Result<T, LimitError>;
