//! Execution helpers handed to the module.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use donflow_core::{Clock, ExecutionId};
use donflow_limits::BoundLimiter;
use donflow_metering::{Deduct, MeteringSession};
use donflow_ports::{
    CapabilityRequest, CapabilityResponse, ExecutionHelper, GetSecretsRequest, PortsError,
    SecretResponse,
};
use tracing::{debug, warn};

use crate::engine::Shared;
use crate::user_logs::UserLogSink;

/// Capability classes with a per-execution call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallClass {
    ChainWrite,
    ChainRead,
    Consensus,
    HttpAction,
}

impl CallClass {
    fn of(request: &CapabilityRequest) -> Option<Self> {
        let id = request.capability_id.as_str();
        if id.starts_with("write_") || request.method == "WriteReport" {
            Some(Self::ChainWrite)
        } else if id.starts_with("evm") || id.starts_with("read_") {
            Some(Self::ChainRead)
        } else if id.starts_with("consensus") {
            Some(Self::Consensus)
        } else if id.starts_with("http-actions") {
            Some(Self::HttpAction)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct CallCounts {
    chain_write: AtomicU64,
    chain_read: AtomicU64,
    consensus: AtomicU64,
    http_action: AtomicU64,
    total: AtomicU64,
}

/// Helper for a trigger execution: every service is live and metered.
pub(crate) struct EngineExecutionHelper {
    shared: Arc<Shared>,
    execution_id: ExecutionId,
    session: MeteringSession,
    logs: UserLogSink,
    calls: CallCounts,
}

impl EngineExecutionHelper {
    pub(crate) fn new(
        shared: Arc<Shared>,
        execution_id: ExecutionId,
        session: MeteringSession,
        logs: UserLogSink,
    ) -> Self {
        Self {
            shared,
            execution_id,
            session,
            logs,
            calls: CallCounts::default(),
        }
    }

    fn check_call_budget(&self, request: &CapabilityRequest) -> Result<(), PortsError> {
        let Some(class) = CallClass::of(request) else {
            return Ok(());
        };
        let limiters = &self.shared.config.limiters;
        let (counter, bound): (&AtomicU64, &BoundLimiter) = match class {
            CallClass::ChainWrite => (&self.calls.chain_write, &limiters.chain_write_targets),
            CallClass::ChainRead => (&self.calls.chain_read, &limiters.chain_read_calls),
            CallClass::Consensus => (&self.calls.consensus, &limiters.consensus_calls),
            CallClass::HttpAction => (&self.calls.http_action, &limiters.http_action_calls),
        };
        let made = counter.fetch_add(1, Ordering::AcqRel) + 1;
        bound.check(made)?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionHelper for EngineExecutionHelper {
    fn execution_id(&self) -> Option<&ExecutionId> {
        Some(&self.execution_id)
    }

    async fn call_capability(
        &self,
        mut request: CapabilityRequest,
    ) -> Result<CapabilityResponse, PortsError> {
        self.check_call_budget(&request)?;

        let config = &self.shared.config;
        let call = self.calls.total.fetch_add(1, Ordering::AcqRel);
        let reference_id = if request.metadata.reference_id.is_empty() {
            call.to_string()
        } else {
            std::mem::take(&mut request.metadata.reference_id)
        };
        request.metadata = self.shared.request_metadata(Some(&self.execution_id), reference_id);

        let capability = config.registry.get_executable(&request.capability_id).await?;
        let _permit = config.limiters.capability_concurrency.wait(1).await?;

        let step_ref = format!("{}#{call}", request.capability_id);
        let report = match &self.session {
            MeteringSession::Active(report) => {
                let deduct = Deduct::ByDerivedAvailability {
                    capability_id: request.capability_id.clone(),
                    user_limit: None,
                    open_call_slots: usize::try_from(config.limiters.capability_concurrency.available())
                        .unwrap_or(usize::MAX)
                        .saturating_add(1),
                };
                match report.deduct(&step_ref, deduct) {
                    Ok(_) => Some(report),
                    Err(e) => {
                        warn!(capability_id = %request.capability_id, error = %e, "could not deduct capability call");
                        None
                    }
                }
            }
            MeteringSession::Unmetered { .. } => None,
        };

        let capability_id = request.capability_id.clone();
        debug!(capability_id = %capability_id, "calling capability");
        let response = config
            .limiters
            .capability_call_time
            .run(capability.execute(request))
            .await??;

        if let Some(report) = report {
            let don_size = match capability.info().await {
                Ok(info) => info.don.map_or(1, |don| u32::try_from(don.members.len()).unwrap_or(u32::MAX)),
                Err(e) => {
                    warn!(capability_id = %capability_id, error = %e, "could not read capability DON size");
                    1
                }
            };
            if let Err(e) = report.settle(&step_ref, &response.metadata, don_size) {
                warn!(capability_id = %capability_id, error = %e, "could not settle capability call");
            }
        }
        Ok(response)
    }

    async fn get_secrets(&self, request: GetSecretsRequest) -> Result<Vec<SecretResponse>, PortsError> {
        self.shared
            .config
            .secrets_fetcher
            .get_secrets(&self.execution_id, request)
            .await
    }

    async fn don_time(&self) -> Result<DateTime<Utc>, PortsError> {
        self.shared.config.don_time.don_time(&self.execution_id).await
    }

    fn node_time(&self) -> DateTime<Utc> {
        self.shared.config.clock.now()
    }

    fn emit_user_log(&self, line: String) {
        self.logs.emit(line);
    }
}

/// Helper for the subscribe call: the module may only log and read the clock.
pub(crate) struct DisallowedExecutionHelper {
    clock: Arc<dyn Clock>,
}

impl DisallowedExecutionHelper {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl ExecutionHelper for DisallowedExecutionHelper {
    fn execution_id(&self) -> Option<&ExecutionId> {
        None
    }

    async fn call_capability(&self, request: CapabilityRequest) -> Result<CapabilityResponse, PortsError> {
        Err(PortsError::Disallowed(format!(
            "capability calls cannot be made during subscription registration: {}",
            request.capability_id
        )))
    }

    async fn get_secrets(&self, _request: GetSecretsRequest) -> Result<Vec<SecretResponse>, PortsError> {
        Err(PortsError::Disallowed(
            "secrets cannot be fetched during subscription registration".to_owned(),
        ))
    }

    async fn don_time(&self) -> Result<DateTime<Utc>, PortsError> {
        Err(PortsError::Disallowed(
            "DON time is not available during subscription registration".to_owned(),
        ))
    }

    fn node_time(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn emit_user_log(&self, line: String) {
        debug!(target: "donflow::user_log", "{line}");
    }
}
