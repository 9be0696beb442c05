//! Billing service port.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BillingError;
use crate::report::MeteringReport;

/// Resource type of execution compute, metered in milliseconds.
pub const COMPUTE_RESOURCE: &str = "RESOURCE_TYPE_COMPUTE";

/// Conversion rate for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRate {
    /// Resource type name, e.g. [`COMPUTE_RESOURCE`].
    pub resource_type: String,
    /// Decimal units of the resource one credit buys.
    pub units_per_credit: String,
}

/// Request for an owner's execution rates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRatesRequest {
    /// Workflow owner address.
    pub workflow_owner: String,
    /// Workflow registry contract address.
    pub workflow_registry_address: String,
    /// Chain the registry lives on.
    pub chain_selector: u64,
}

/// Rates applying to an owner's executions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRates {
    /// Per-resource rates.
    pub rate_cards: Vec<ResourceRate>,
    /// Gas tokens per credit, keyed by chain selector.
    pub gas_tokens_per_credit: BTreeMap<u64, String>,
}

/// Credit reservation for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveCreditsRequest {
    /// Workflow owner address.
    pub workflow_owner: String,
    /// Workflow ID.
    pub workflow_id: String,
    /// Execution ID.
    pub workflow_execution_id: String,
    /// Workflow registry contract address.
    pub workflow_registry_address: String,
    /// Chain the registry lives on.
    pub workflow_registry_chain_selector: u64,
    /// Credits to reserve; `None` opens an unbounded reservation.
    pub credits: Option<String>,
}

/// Outcome of a reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveCreditsResponse {
    /// Whether the owner can pay.
    pub success: bool,
    /// Reserved credits, decimal; empty means zero.
    pub credits: String,
}

/// Receipt closing one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReceipt {
    /// Workflow owner address.
    pub workflow_owner: String,
    /// Workflow ID.
    pub workflow_id: String,
    /// Execution ID.
    pub workflow_execution_id: String,
    /// Workflow registry contract address.
    pub workflow_registry_address: String,
    /// Chain the registry lives on.
    pub workflow_registry_chain_selector: u64,
    /// Full metering report.
    pub metering: MeteringReport,
    /// Credits consumed, decimal.
    pub credits_consumed: String,
}

/// The billing service.
#[async_trait]
pub trait BillingClient: Send + Sync {
    /// Rates for `request.workflow_owner`.
    async fn get_workflow_execution_rates(
        &self,
        request: ExecutionRatesRequest,
    ) -> Result<ExecutionRates, BillingError>;

    /// Reserve credits for one execution.
    async fn reserve_credits(
        &self,
        request: ReserveCreditsRequest,
    ) -> Result<ReserveCreditsResponse, BillingError>;

    /// Submit the final receipt. `Ok(false)` means the service did not acknowledge it.
    async fn submit_workflow_receipt(&self, receipt: WorkflowReceipt) -> Result<bool, BillingError>;
}
