//! Error types for secrets fetching and threshold decryption.

use donflow_limits::LimitError;
use donflow_ports::PortsError;
use thiserror::Error;

/// Errors raised while fetching or decrypting secrets
#[derive(Error, Debug)]
pub enum SecretsError {
    /// The vault capability configuration is unusable
    #[error("{0}")]
    Config(String),

    /// A registry or capability call failed
    #[error("{context}: {source}")]
    Port {
        /// What was being attempted
        context: String,
        /// Underlying port error
        #[source]
        source: PortsError,
    },

    /// The secrets concurrency limiter rejected the fetch
    #[error(transparent)]
    Limit(#[from] LimitError),

    /// The owner address cannot be normalized
    #[error("invalid owner address: {0}")]
    InvalidOwner(String),

    /// Hex, JSON, or point/scalar decoding failed
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A ciphertext failed its integrity proof
    #[error("ciphertext verification failed")]
    InvalidCiphertext,

    /// A decryption share failed verification
    #[error("invalid decryption share {index}: {reason}")]
    InvalidShare {
        /// Share index
        index: u32,
        /// Why it was rejected
        reason: String,
    },

    /// Fewer valid shares than the reconstruction threshold
    #[error("not enough decryption shares to decrypt the secret: have {have}, need at least {need}")]
    NotEnoughShares {
        /// Valid shares available
        have: usize,
        /// Threshold
        need: usize,
    },

    /// Authenticated decryption failed
    #[error("decryption failed: {0}")]
    Decryption(String),
}

impl SecretsError {
    /// Wrap a port error with context
    pub fn port(context: impl Into<String>, source: PortsError) -> Self {
        Self::Port {
            context: context.into(),
            source,
        }
    }

    /// Create an encoding error
    pub fn encoding(message: impl std::fmt::Display) -> Self {
        Self::Encoding(message.to_string())
    }
}

impl From<SecretsError> for PortsError {
    fn from(err: SecretsError) -> Self {
        match err {
            SecretsError::Limit(limit) => Self::Limit(limit),
            SecretsError::Port { source, .. } if matches!(source, PortsError::Cancelled) => {
                Self::Cancelled
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type for secrets operations
pub type SecretsResult<T> = Result<T, SecretsError>;
