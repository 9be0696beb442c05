//! Open reports of one workflow, keyed by execution ID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{error, warn};

use donflow_ports::{MeteringNodeDetail, ResponseMetadata};
use donflow_telemetry::{Labels, TelemetryService, labels, metrics};

use crate::billing::{BillingClient, COMPUTE_RESOURCE};
use crate::error::{MeteringError, MeteringResult};
use crate::report::{Deduct, RegistryInfo, Report};

/// Capability ID recorded for the standard compute deduction.
pub const STANDARD_COMPUTE_DEDUCTION: &str = "v2-standard-deduction-compute";

/// Engine version tag carried in reports.
pub const ENGINE_VERSION: &str = "v2";

/// Extra compute reserved on top of the execution timeout for cancellation to
/// propagate.
pub const CANCELLATION_PAD: Duration = Duration::from_millis(1000);

/// Whether an execution is metered.
#[derive(Debug, Clone)]
pub enum MeteringSession {
    /// Credits are reserved and compute is deducted.
    Active(Arc<Report>),
    /// Metering is unavailable; the execution runs without it.
    Unmetered {
        /// Why.
        reason: String,
    },
}

impl MeteringSession {
    /// Whether a report backs the session.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Concurrency-safe set of open reports.
pub struct Reports {
    client: Option<Arc<dyn BillingClient>>,
    telemetry: Arc<dyn TelemetryService>,
    labels: Labels,
    registry: RegistryInfo,
    reports: RwLock<HashMap<String, Arc<Report>>>,
}

impl Reports {
    /// Reports for the workflow described by `labels`.
    pub fn new(
        client: Option<Arc<dyn BillingClient>>,
        telemetry: Arc<dyn TelemetryService>,
        labels: Labels,
        registry: RegistryInfo,
    ) -> Self {
        Self {
            client,
            telemetry,
            labels,
            registry,
            reports: RwLock::new(HashMap::new()),
        }
    }

    /// The open report of `execution_id`.
    #[must_use]
    pub fn get(&self, execution_id: &str) -> Option<Arc<Report>> {
        self.reports.read().get(execution_id).cloned()
    }

    /// Number of open reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    /// Whether no report is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }

    /// Open a report for `execution_id`, tagged with `extra` labels.
    pub async fn start(&self, execution_id: &str, extra: &Labels) -> MeteringResult<Arc<Report>> {
        if self.reports.read().contains_key(execution_id) {
            return Err(MeteringError::ReportExists);
        }
        let mut labels = self.labels.clone();
        for (key, value) in extra.iter() {
            labels.insert(key, value);
        }
        labels.insert(labels::EXECUTION_ID, execution_id);

        let report = Arc::new(
            Report::new(
                labels,
                self.client.clone(),
                Arc::clone(&self.telemetry),
                self.registry.clone(),
            )
            .await?,
        );

        let mut reports = self.reports.write();
        if reports.contains_key(execution_id) {
            return Err(MeteringError::ReportExists);
        }
        reports.insert(execution_id.to_owned(), Arc::clone(&report));
        Ok(report)
    }

    /// Close the report of `execution_id`: emit it and submit the receipt.
    ///
    /// The report is removed even when either step fails.
    pub async fn end(&self, execution_id: &str) -> MeteringResult<()> {
        let report = self
            .reports
            .write()
            .remove(execution_id)
            .ok_or(MeteringError::ReportNotFound)?;

        let mut errors = Vec::new();
        if let Err(e) = report.emit_receipt() {
            errors.push(e);
        }
        if let Err(e) = report.send_receipt().await {
            errors.push(e);
        }
        if !errors.is_empty() {
            self.telemetry
                .metrics()
                .counter(metrics::METERING_REPORTS_MISSING)
                .inc_by(errors.len() as u64);
        }
        MeteringError::join(errors)
    }

    /// Start metering an execution allowed to run for `execution_timeout`.
    ///
    /// Opens the report, reserves credits and deducts the standard compute
    /// charge. Anything short of a refused reservation degrades to
    /// [`MeteringSession::Unmetered`]; a refused reservation is the only `Err`.
    pub async fn begin(
        &self,
        execution_id: &str,
        extra: &Labels,
        execution_timeout: Duration,
    ) -> MeteringResult<MeteringSession> {
        let report = match self.start(execution_id, extra).await {
            Ok(report) => report,
            Err(e) => {
                error!(execution_id, error = %e, "could not start metering; continuing without metering");
                return Ok(MeteringSession::Unmetered { reason: e.to_string() });
            }
        };

        match report.reserve().await {
            Ok(()) => {}
            Err(MeteringError::InsufficientFunding) => {
                self.reports.write().remove(execution_id);
                return Err(MeteringError::InsufficientFunding);
            }
            Err(e) => {
                error!(execution_id, error = %e, "could not reserve metering; continuing without metering");
                self.reports.write().remove(execution_id);
                return Ok(MeteringSession::Unmetered { reason: e.to_string() });
            }
        }

        let compute_ms = execution_timeout.saturating_add(CANCELLATION_PAD).as_millis();
        let deduct = Deduct::ByResource {
            resource: COMPUTE_RESOURCE.to_owned(),
            capability_id: STANDARD_COMPUTE_DEDUCTION.to_owned(),
            amount: Decimal::from(u64::try_from(compute_ms).unwrap_or(u64::MAX)),
        };
        if let Err(e) = report.deduct(COMPUTE_RESOURCE, deduct) {
            error!(execution_id, error = %e, "could not deduct standard compute balance");
        }
        Ok(MeteringSession::Active(report))
    }

    /// Settle the compute spent by `peer_id` over `duration` and end the
    /// report. Failures are logged only.
    pub async fn finish(&self, session: &MeteringSession, peer_id: &str, duration: Duration) {
        let MeteringSession::Active(report) = session else {
            return;
        };
        let metadata = ResponseMetadata {
            metering: vec![MeteringNodeDetail {
                peer_id: peer_id.to_owned(),
                spend_unit: COMPUTE_RESOURCE.to_owned(),
                spend_value: duration.as_millis().to_string(),
            }],
        };
        if let Err(e) = report.settle(COMPUTE_RESOURCE, &metadata, 1) {
            warn!(execution_id = report.execution_id(), error = %e, "could not settle compute metering");
        }
        if let Err(e) = self.end(report.execution_id()).await {
            warn!(execution_id = report.execution_id(), error = %e, "could not end metering report");
        }
    }
}

impl std::fmt::Debug for Reports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reports")
            .field("open", &self.len())
            .field("billing_client", &self.client.is_some())
            .finish_non_exhaustive()
    }
}
