//! Metering and billing errors.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the billing service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// The service could not be reached.
    #[error("billing service unavailable: {0}")]
    Unavailable(String),

    /// The call ran out of time.
    #[error("billing call exceeded its deadline after {0:?}")]
    DeadlineExceeded(Duration),

    /// The service is shedding load.
    #[error("billing service exhausted: {0}")]
    ResourceExhausted(String),

    /// The service answered with an error.
    #[error("billing service rejected the request: {0}")]
    Rejected(String),
}

impl BillingError {
    /// Whether repeating the call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::DeadlineExceeded(_) | Self::ResourceExhausted(_)
        )
    }
}

/// Errors raised by metering reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeteringError {
    /// Owner, workflow ID or execution ID label missing.
    #[error("missing required labels: owner, workflowID, workflowExecutionID")]
    MissingLabels,

    /// No billing client was configured.
    #[error("no billing client has been configured")]
    NoBillingClient,

    /// The owner cannot pay for the execution.
    #[error("insufficient funding")]
    InsufficientFunding,

    /// The receipt submission produced no acknowledgement.
    #[error("failed to submit workflow receipt")]
    ReceiptFailed,

    /// `reserve` was not called first.
    #[error("must call Reserve first")]
    NoReserve,

    /// The step already has a deduction.
    #[error("step deduct already exists")]
    StepDeductExists,

    /// No concurrent call slots to split the balance over.
    #[error("openConcurrentCallSlots must be greater than 0")]
    NoOpenCalls,

    /// `deduct` was not called for the step.
    #[error("must call Deduct first")]
    NoDeduct,

    /// The step was already settled.
    #[error("step spend already exists")]
    StepSpendExists,

    /// No report for the execution.
    #[error("report not found")]
    ReportNotFound,

    /// A report for the execution is already open.
    #[error("report already exists")]
    ReportExists,

    /// The billing service returned no rates.
    #[error("empty rate card")]
    EmptyRateCard,

    /// The rate card has no usable rate for the resource.
    #[error("no rate for resource type {0}")]
    UnknownResource(String),

    /// The local balance cannot cover the amount.
    #[error("insufficient balance: have {balance}, need {amount}")]
    InsufficientBalance {
        /// Available credits.
        balance: String,
        /// Requested credits.
        amount: String,
    },

    /// A decimal could not be parsed.
    #[error("invalid decimal {value:?}: {reason}")]
    InvalidDecimal {
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// The report could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A billing service call failed.
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// Several failures, e.g. both emit and submit on report end.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<MeteringError>),
}

impl MeteringError {
    /// Collapse a list of failures; `Ok` when empty.
    pub fn join(mut errors: Vec<Self>) -> MeteringResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

/// Result type for metering operations.
pub type MeteringResult<T> = Result<T, MeteringError>;
