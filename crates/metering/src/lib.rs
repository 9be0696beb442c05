#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # donflow Metering
//!
//! Billing sessions for workflow executions.
//!
//! Each execution gets a [`Report`]: credits are reserved with the
//! [`BillingClient`], earmarked per step with [`Deduct`], settled against the
//! spends nodes report, and closed with a receipt. [`Reports`] tracks the
//! open reports of one workflow and offers the engine a single
//! [`Reports::begin`] / [`Reports::finish`] pair that turns every soft
//! failure into [`MeteringSession::Unmetered`].
//!
//! Credit accounting degrades to metering mode rather than failing: the
//! report keeps recording raw spends and says why in its message.

pub mod balance;
pub mod billing;
pub mod error;
pub mod report;
pub mod reports;

pub use balance::{BalanceStore, RateCard};
pub use billing::{
    BillingClient, COMPUTE_RESOURCE, ExecutionRates, ExecutionRatesRequest, ReserveCreditsRequest,
    ReserveCreditsResponse, ResourceRate, WorkflowReceipt,
};
pub use error::{BillingError, MeteringError, MeteringResult};
pub use report::{Deduct, MeteringReport, RegistryInfo, Report};
pub use reports::{ENGINE_VERSION, MeteringSession, Reports, STANDARD_COMPUTE_DEDUCTION};
