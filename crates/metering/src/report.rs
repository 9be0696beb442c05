//! One execution's metering report.
//!
//! A report moves through `reserve`, any number of `deduct`/`settle` pairs
//! keyed by step reference, and finally emission and receipt submission.
//! Whenever credit accounting becomes impossible (no billing client, empty
//! rate card, unknown resource, billing outage) the report switches to
//! metering mode: it keeps recording raw spends but stops enforcing the
//! balance. The first reason is logged once; all reasons end up in the
//! report message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use donflow_ports::ResponseMetadata;
use donflow_telemetry::{Labels, TelemetryService, WorkflowEvent, labels, metrics};

use crate::balance::{BalanceStore, RateCard, is_gas, median, parse_decimal};
use crate::billing::{BillingClient, ExecutionRatesRequest, ReserveCreditsRequest, WorkflowReceipt};
use crate::error::{MeteringError, MeteringResult};

/// Fixed decimal places of credit values in reports.
pub const DECIMAL_PRECISION: u32 = 10;

const GAS_DECIMALS: u32 = 18;
const DEFAULT_MAX_RETRIES: u32 = 1;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Where the workflow is registered, and which engine runs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryInfo {
    /// Workflow registry contract address.
    pub address: String,
    /// Chain selector of the registry, decimal.
    pub chain_selector: String,
    /// Engine version tag carried in reports.
    pub engine_version: String,
}

/// How a step earmarks credits before a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deduct {
    /// Earmark the credits worth `amount` units of `resource`.
    ByResource {
        /// Resource type, e.g. [`COMPUTE_RESOURCE`](crate::COMPUTE_RESOURCE).
        resource: String,
        /// Capability the step calls.
        capability_id: String,
        /// Units to earmark.
        amount: Decimal,
    },
    /// Earmark an equal split of the remaining balance over the open call
    /// slots, capped by the user's limit.
    ByDerivedAvailability {
        /// Capability the step calls.
        capability_id: String,
        /// User spend cap in credits.
        user_limit: Option<Decimal>,
        /// Calls that may still run concurrently.
        open_call_slots: usize,
    },
}

impl Deduct {
    fn capability_id(&self) -> &str {
        match self {
            Self::ByResource { capability_id, .. } | Self::ByDerivedAvailability { capability_id, .. } => {
                capability_id
            }
        }
    }
}

#[derive(Debug, Clone)]
struct NodeSpend {
    peer_id: String,
    spend_value: String,
    credits: Decimal,
}

#[derive(Debug, Clone)]
struct AggregatedSpend {
    value: Decimal,
    credits: Decimal,
}

#[derive(Debug, Clone, Default)]
struct ReportStep {
    capability_id: String,
    cap_don_n: u32,
    deduction: Decimal,
    spends: Option<BTreeMap<String, Vec<NodeSpend>>>,
    aggregated: BTreeMap<String, AggregatedSpend>,
}

#[derive(Debug, Default)]
struct ReportState {
    reserved: bool,
    metering_mode: bool,
    metering_mode_reasons: Vec<String>,
    balance: BalanceStore,
    steps: BTreeMap<String, ReportStep>,
}

impl ReportState {
    fn switch_to_metering_mode(&mut self, reason: impl std::fmt::Display, execution_id: &str) {
        let reason = reason.to_string();
        if !self.metering_mode {
            error!(execution_id, reason = %reason, "switching to metering mode");
            self.metering_mode = true;
        }
        self.metering_mode_reasons.push(reason);
    }
}

/// Spend of one node as it appears in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetail {
    /// Reporting peer.
    pub peer_id: String,
    /// Resource type.
    pub spend_unit: String,
    /// Raw reported value.
    pub spend_value: String,
    /// Value in credits.
    pub spend_value_credits: String,
}

/// Aggregated spend of one resource in one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedDetail {
    /// Resource type.
    pub spend_unit: String,
    /// Median spend, scaled to the capability DON.
    pub spend_value: String,
    /// Value in credits.
    pub spend_value_credits: String,
}

/// One step of a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDetail {
    /// Capability the step called.
    pub capability_id: String,
    /// Node count of the capability DON.
    pub capdon_n: u32,
    /// Per-node spends, resource types in descending order.
    pub nodes: Vec<NodeDetail>,
    /// Per-resource aggregates.
    pub aggregated: Vec<AggregatedDetail>,
}

/// Workflow context of a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Workflow owner.
    pub workflow_owner: String,
    /// Workflow ID.
    pub workflow_id: String,
    /// Workflow name.
    pub workflow_name: String,
    /// Execution ID.
    pub workflow_execution_id: String,
    /// Trigger that started the execution.
    pub trigger_id: String,
    /// Billing organization.
    pub org_id: String,
    /// Workflow registry contract address.
    pub workflow_registry_address: String,
    /// Chain selector of the registry.
    pub workflow_registry_chain: String,
    /// Engine version tag.
    pub engine_version: String,
}

/// The body emitted as telemetry and submitted with the receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringReport {
    /// Steps by reference.
    pub steps: BTreeMap<String, StepDetail>,
    /// Workflow context.
    pub metadata: ReportMetadata,
    /// Whether credit accounting was abandoned.
    pub metering_mode: bool,
    /// Every reason metering mode was entered, joined.
    pub message: String,
}

/// Metering state for one execution.
pub struct Report {
    labels: Labels,
    execution_id: String,
    client: Option<Arc<dyn BillingClient>>,
    telemetry: Arc<dyn TelemetryService>,
    registry: RegistryInfo,
    chain_selector: u64,
    max_retries: u32,
    retry_delay: Duration,
    state: Mutex<ReportState>,
}

impl Report {
    /// Open a report and load the owner's rate card.
    ///
    /// Never fails for billing reasons: a missing client, unparseable
    /// registry chain, rate lookup failure or empty rate card puts the
    /// report in metering mode instead.
    pub async fn new(
        labels: Labels,
        client: Option<Arc<dyn BillingClient>>,
        telemetry: Arc<dyn TelemetryService>,
        registry: RegistryInfo,
    ) -> MeteringResult<Self> {
        let required = [labels::WORKFLOW_OWNER, labels::WORKFLOW_ID, labels::EXECUTION_ID];
        if required.iter().any(|key| labels.get(key).is_none()) {
            return Err(MeteringError::MissingLabels);
        }
        let execution_id = labels.get(labels::EXECUTION_ID).unwrap_or_default().to_owned();

        let mut state = ReportState::default();
        if client.is_none() {
            state.switch_to_metering_mode(MeteringError::NoBillingClient, &execution_id);
        }
        let chain_selector = registry.chain_selector.parse::<u64>().unwrap_or_else(|e| {
            state.switch_to_metering_mode(
                format!("failed to parse registry chain selector: {e}"),
                &execution_id,
            );
            0
        });

        let mut rates = RateCard::default();
        if let Some(client) = &client {
            let request = ExecutionRatesRequest {
                workflow_owner: labels.get(labels::WORKFLOW_OWNER).unwrap_or_default().to_owned(),
                workflow_registry_address: registry.address.clone(),
                chain_selector,
            };
            match client.get_workflow_execution_rates(request).await {
                Ok(response) => match RateCard::from_rates(&response) {
                    Ok(card) => rates = card,
                    Err(e) => state.switch_to_metering_mode(e, &execution_id),
                },
                Err(e) => state.switch_to_metering_mode(e, &execution_id),
            }
        }
        if rates.is_empty() {
            state.switch_to_metering_mode(MeteringError::EmptyRateCard, &execution_id);
        }
        state.balance = BalanceStore::new(Decimal::ZERO, rates);

        Ok(Self {
            labels,
            execution_id,
            client,
            telemetry,
            registry,
            chain_selector,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            state: Mutex::new(state),
        })
    }

    /// Override receipt retry behaviour.
    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    /// Execution the report belongs to.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Whether credit accounting was abandoned.
    #[must_use]
    pub fn is_metering_mode(&self) -> bool {
        self.state.lock().metering_mode
    }

    /// Credits still available.
    #[must_use]
    pub fn balance(&self) -> Decimal {
        self.state.lock().balance.get()
    }

    /// Credits spent so far.
    #[must_use]
    pub fn spent(&self) -> Decimal {
        self.state.lock().balance.spent()
    }

    fn label(&self, key: &str) -> String {
        self.labels.get(key).unwrap_or_default().to_owned()
    }

    /// Reserve the execution's credit balance. Must precede `deduct` and `settle`.
    ///
    /// Billing outages fail open into metering mode; only a refused
    /// reservation is an error.
    pub async fn reserve(&self) -> MeteringResult<()> {
        self.state.lock().reserved = true;

        let Some(client) = &self.client else {
            self.state
                .lock()
                .switch_to_metering_mode(MeteringError::NoBillingClient, &self.execution_id);
            return Ok(());
        };

        let request = ReserveCreditsRequest {
            workflow_owner: self.label(labels::WORKFLOW_OWNER),
            workflow_id: self.label(labels::WORKFLOW_ID),
            workflow_execution_id: self.execution_id.clone(),
            workflow_registry_address: self.registry.address.clone(),
            workflow_registry_chain_selector: self.chain_selector,
            credits: None,
        };
        let response = match client.reserve_credits(request).await {
            Ok(response) => response,
            Err(e) => {
                self.state.lock().switch_to_metering_mode(e, &self.execution_id);
                return Ok(());
            }
        };
        if !response.success {
            return Err(MeteringError::InsufficientFunding);
        }

        let credits = if response.credits.is_empty() {
            debug!(execution_id = %self.execution_id, "empty credits; using 0");
            "0"
        } else {
            response.credits.as_str()
        };
        let mut state = self.state.lock();
        match parse_decimal(credits) {
            Ok(credits) => state.balance.set(credits),
            Err(e) => state.switch_to_metering_mode(
                format!("failed to parse credits {credits}: {e}"),
                &self.execution_id,
            ),
        }
        Ok(())
    }

    /// Earmark credits for `step_ref`; returns the earmarked amount.
    ///
    /// Each step deducts once. The step is recorded even when the balance
    /// cannot cover the earmark.
    pub fn deduct(&self, step_ref: &str, deduct: Deduct) -> MeteringResult<Decimal> {
        let mut state = self.state.lock();
        if !state.reserved {
            return Err(MeteringError::NoReserve);
        }
        if state.steps.contains_key(step_ref) {
            return Err(MeteringError::StepDeductExists);
        }

        let mut step = ReportStep {
            capability_id: deduct.capability_id().to_owned(),
            ..ReportStep::default()
        };
        let result = match deduct {
            Deduct::ByResource { resource, amount, .. } => {
                match state.balance.convert_to_balance(&resource, amount) {
                    Ok(credits) => step.deduction = credits,
                    Err(e) => state.switch_to_metering_mode(
                        format!("failed to convert to balance [{resource}]: {e}"),
                        &self.execution_id,
                    ),
                }
                if state.metering_mode {
                    Ok(step.deduction)
                } else {
                    state.balance.minus(step.deduction).map(|()| step.deduction)
                }
            }
            Deduct::ByDerivedAvailability {
                user_limit,
                open_call_slots,
                ..
            } => {
                if open_call_slots == 0 {
                    Err(MeteringError::NoOpenCalls)
                } else if state.metering_mode {
                    Ok(Decimal::ZERO)
                } else {
                    let share = state.balance.get() / Decimal::from(open_call_slots);
                    step.deduction = user_limit.map_or(share, |limit| share.min(limit));
                    state.balance.minus(step.deduction).map(|()| step.deduction)
                }
            }
        };
        state.steps.insert(step_ref.to_owned(), step);
        result
    }

    /// Record the per-node spends of `step_ref` and refund what was
    /// earmarked beyond the actual spend.
    ///
    /// Spends are grouped by unit and aggregated by median; non-gas spends
    /// are scaled by `cap_don_n` (0 counts as 1) since every node of the
    /// capability DON ran the call. Unparseable values are kept in the report
    /// but left out of the balance.
    pub fn settle(&self, step_ref: &str, metadata: &ResponseMetadata, cap_don_n: u32) -> MeteringResult<()> {
        let mut state = self.state.lock();
        if !state.reserved {
            return Err(MeteringError::NoReserve);
        }
        let Some(mut step) = state.steps.get(step_ref).cloned() else {
            return Err(MeteringError::NoDeduct);
        };
        if step.spends.is_some() {
            return Err(MeteringError::StepSpendExists);
        }
        let cap_don_n = cap_don_n.max(1);

        let mut by_unit: BTreeMap<String, Vec<NodeSpend>> = BTreeMap::new();
        for detail in &metadata.metering {
            by_unit.entry(detail.spend_unit.clone()).or_default().push(NodeSpend {
                peer_id: detail.peer_id.clone(),
                spend_value: detail.spend_value.clone(),
                credits: Decimal::ZERO,
            });
        }

        let mut spent_credits = Decimal::ZERO;
        for (unit, spends) in &mut by_unit {
            let mut values = Vec::with_capacity(spends.len());
            for spend in spends.iter_mut() {
                let Ok(mut value) = parse_decimal(&spend.spend_value) else {
                    info!(
                        execution_id = %self.execution_id,
                        value = %spend.spend_value,
                        "ignoring unparseable spend value"
                    );
                    continue;
                };
                if is_gas(unit) {
                    let Some(fixed_point) = value.checked_mul(Decimal::from(10u64.pow(GAS_DECIMALS))) else {
                        state.switch_to_metering_mode(
                            format!("gas spend {} out of range [{unit}]", spend.spend_value),
                            &self.execution_id,
                        );
                        continue;
                    };
                    value = fixed_point;
                }
                if let Ok(credits) = state.balance.convert_to_balance(unit, value) {
                    spend.credits = credits;
                }
                values.push(value);
            }

            if is_gas(unit) && values.len() > 1 {
                state.switch_to_metering_mode(
                    format!("multiple executions for single execution unit [{unit}]"),
                    &self.execution_id,
                );
            }
            let Some(aggregated) = median(&mut values) else {
                continue;
            };
            let scaled = if is_gas(unit) {
                aggregated
            } else {
                aggregated * Decimal::from(cap_don_n)
            };
            let credits = match state.balance.convert_to_balance(unit, scaled) {
                Ok(credits) => {
                    spent_credits += credits;
                    credits
                }
                Err(e) => {
                    warn!(
                        execution_id = %self.execution_id,
                        unit = %unit,
                        "settled spend unit has no rate"
                    );
                    state.switch_to_metering_mode(format!("attempted to Settle [{unit}]: {e}"), &self.execution_id);
                    Decimal::ZERO
                }
            };
            step.aggregated.insert(unit.clone(), AggregatedSpend { value: aggregated, credits });
        }

        step.spends = Some(by_unit);
        step.cap_don_n = cap_don_n;
        let refund = step.deduction - spent_credits;
        state.steps.insert(step_ref.to_owned(), step);

        if state.metering_mode {
            return Ok(());
        }
        if state.balance.add(refund).is_err() {
            info!(execution_id = %self.execution_id, "invariant: spend exceeded reserve");
        }
        state.balance.add_spent(spent_credits);
        Ok(())
    }

    /// Snapshot the report body.
    #[must_use]
    pub fn format_report(&self) -> MeteringReport {
        let state = self.state.lock();
        let fixed = |value: &Decimal| format!("{value:.prec$}", prec = DECIMAL_PRECISION as usize);

        let steps = state
            .steps
            .iter()
            .map(|(step_ref, step)| {
                let mut detail = StepDetail {
                    capability_id: step.capability_id.clone(),
                    capdon_n: step.cap_don_n,
                    ..StepDetail::default()
                };
                if let Some(spends) = &step.spends {
                    for (unit, nodes) in spends.iter().rev() {
                        detail.nodes.extend(nodes.iter().map(|node| NodeDetail {
                            peer_id: node.peer_id.clone(),
                            spend_unit: unit.clone(),
                            spend_value: node.spend_value.clone(),
                            spend_value_credits: fixed(&node.credits),
                        }));
                        if let Some(aggregated) = step.aggregated.get(unit) {
                            detail.aggregated.push(AggregatedDetail {
                                spend_unit: unit.clone(),
                                spend_value: fixed(&aggregated.value),
                                spend_value_credits: fixed(&aggregated.credits),
                            });
                        }
                    }
                }
                (step_ref.clone(), detail)
            })
            .collect();

        MeteringReport {
            steps,
            metadata: ReportMetadata {
                workflow_owner: self.label(labels::WORKFLOW_OWNER),
                workflow_id: self.label(labels::WORKFLOW_ID),
                workflow_name: self.label(labels::WORKFLOW_NAME),
                workflow_execution_id: self.execution_id.clone(),
                trigger_id: self.label(labels::TRIGGER_ID),
                org_id: self.label(labels::ORG_ID),
                workflow_registry_address: self.registry.address.clone(),
                workflow_registry_chain: self.chain_selector.to_string(),
                engine_version: self.registry.engine_version.clone(),
            },
            metering_mode: state.metering_mode,
            message: state.metering_mode_reasons.join("\n"),
        }
    }

    /// Publish the report as a telemetry event.
    pub fn emit_receipt(&self) -> MeteringResult<()> {
        if !self.state.lock().reserved {
            return Err(MeteringError::NoReserve);
        }
        let report = self.format_report();
        let step_refs: Vec<String> = report
            .steps
            .iter()
            .map(|(step_ref, step)| format!("{step_ref}:{}", step.capability_id))
            .collect();
        debug!(execution_id = %self.execution_id, steps = %step_refs.join(","), "emitting metering report");

        let body = serde_json::to_value(&report).map_err(|e| MeteringError::Serialization(e.to_string()))?;
        self.telemetry.event_bus().emit(WorkflowEvent::MeteringReport {
            labels: self.labels.clone(),
            report: body,
        });
        Ok(())
    }

    /// Submit the receipt to billing, retrying retryable failures.
    pub async fn send_receipt(&self) -> MeteringResult<()> {
        let metering_mode = {
            let state = self.state.lock();
            if !state.reserved {
                return Err(MeteringError::NoReserve);
            }
            state.metering_mode
        };
        let Some(client) = &self.client else {
            return Err(MeteringError::NoBillingClient);
        };
        self.telemetry
            .metrics()
            .gauge(metrics::METERING_MODE)
            .set(i64::from(metering_mode));

        let receipt = WorkflowReceipt {
            workflow_owner: self.label(labels::WORKFLOW_OWNER),
            workflow_id: self.label(labels::WORKFLOW_ID),
            workflow_execution_id: self.execution_id.clone(),
            workflow_registry_address: self.registry.address.clone(),
            workflow_registry_chain_selector: self.chain_selector,
            metering: self.format_report(),
            credits_consumed: self.spent().to_string(),
        };

        let mut attempt = 0;
        loop {
            match client.submit_workflow_receipt(receipt.clone()).await {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(MeteringError::ReceiptFailed),
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    attempt += 1;
                    warn!(
                        execution_id = %self.execution_id,
                        attempt,
                        max_attempts = self.max_retries + 1,
                        retry_delay = ?self.retry_delay,
                        error = %e,
                        "receipt submission failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Report")
            .field("execution_id", &self.execution_id)
            .field("metering_mode", &self.is_metering_mode())
            .finish_non_exhaustive()
    }
}
