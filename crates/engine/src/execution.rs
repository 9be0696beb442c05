//! One execution of the module for one trigger event.

use std::sync::Arc;

use donflow_core::ExecutionId;
use donflow_metering::MeteringSession;
use donflow_ports::{ExecuteRequest, ExecutionHelper, ExecutionResult, PortsError, RequestKind};
use donflow_telemetry::{Gauge, Labels, WorkflowEvent, labels, metrics};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::engine::Shared;
use crate::helper::EngineExecutionHelper;
use crate::hooks::ExecutionStatus;
use crate::triggers::EnqueuedTriggerEvent;
use crate::user_logs::UserLogForwarder;

/// Counts an execution in flight for as long as it lives.
struct InFlight(Gauge);

impl InFlight {
    fn enter(gauge: Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

fn classify(outcome: &Result<ExecutionResult, PortsError>) -> ExecutionStatus {
    match outcome {
        Err(e) if e.is_deadline_exceeded() => ExecutionStatus::Timeout,
        Err(_) => ExecutionStatus::Errored,
        Ok(result) if result.error_message().is_some() => ExecutionStatus::Errored,
        Ok(_) => ExecutionStatus::Completed,
    }
}

impl Shared {
    /// Run the module for `queued` and report the outcome.
    pub(crate) async fn execute(self: &Arc<Self>, queued: EnqueuedTriggerEvent) {
        let execution_id = ExecutionId::derive(&self.config.workflow_id, &queued.event.id);
        let span = info_span!(
            "execution",
            execution_id = %execution_id,
            trigger_id = %queued.trigger_id,
        );
        self.run_execution(execution_id, queued).instrument(span).await;
    }

    async fn run_execution(self: &Arc<Self>, execution_id: ExecutionId, queued: EnqueuedTriggerEvent) {
        let config = &self.config;
        let telemetry = &config.telemetry;
        let limiters = &config.limiters;

        // 1. Rate limit
        if let Err(e) = config.global_rate.allow(&config.tenant) {
            warn!(error = %e, "execution rate limited");
            config.hooks.on_rate_limited(&execution_id);
            return;
        }

        // 2. Organization
        let org_id = match &config.org_resolver {
            Some(resolver) => resolver.get(&config.workflow_owner).await.unwrap_or_else(|e| {
                warn!(error = %e, "failed to resolve organization");
                String::new()
            }),
            None => String::new(),
        };
        let extra = Labels::new()
            .with(labels::ORG_ID, &org_id)
            .with(labels::TRIGGER_ID, &queued.trigger_id);
        let mut execution_labels = self.labels.clone();
        for (key, value) in extra.iter() {
            execution_labels.insert(key, value);
        }
        execution_labels.insert(labels::EXECUTION_ID, execution_id.as_str());

        let meter = telemetry.metrics();
        let _in_flight = InFlight::enter(meter.gauge(metrics::EXECUTIONS_IN_FLIGHT));

        // 3. Metering
        let session = match self
            .reports
            .begin(execution_id.as_str(), &extra, limiters.execution_time.limit())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "metering refused the execution");
                return;
            }
        };
        let metering_mode = match &session {
            MeteringSession::Active(report) => report.is_metering_mode(),
            MeteringSession::Unmetered { reason } => {
                debug!(reason = %reason, "execution is not metered");
                true
            }
        };
        meter.gauge(metrics::METERING_MODE).set(i64::from(metering_mode));

        // 4. User logs
        let (logs, forwarder) = UserLogForwarder::channel(
            limiters.log_event.clone(),
            limiters.log_line.clone(),
            execution_labels.clone(),
            Arc::clone(telemetry),
        );
        self.tracker.spawn(forwarder.run().instrument(Span::current()));

        // 5. Run the module
        let helper: Arc<dyn ExecutionHelper> = Arc::new(EngineExecutionHelper::new(
            Arc::clone(self),
            execution_id.clone(),
            session.clone(),
            logs,
        ));
        let request = ExecuteRequest {
            kind: RequestKind::Trigger {
                index: queued.index,
                payload: queued.event.payload,
            },
            config: config.workflow_config.clone(),
            max_response_size: limiters.execution_response.limit(),
        };

        info!("execution started");
        telemetry.event_bus().emit(WorkflowEvent::ExecutionStarted {
            labels: execution_labels.clone(),
            trigger_id: queued.trigger_id.clone(),
        });
        let started = tokio::time::Instant::now();
        let outcome = tokio::select! {
            () = self.execution_cancel.cancelled() => Err(PortsError::Cancelled),
            outcome = limiters.execution_time.run(config.module.execute(request, helper)) => {
                outcome.map_err(PortsError::from).and_then(|result| result)
            }
        };
        let duration = started.elapsed();

        // 6. Report
        let status = classify(&outcome);
        telemetry.event_bus().emit(WorkflowEvent::ExecutionFinished {
            labels: execution_labels.clone(),
            status: status.as_str().to_owned(),
            duration,
        });
        let status_labels = Labels::new().with("status", status.as_str());
        meter.counter_with(metrics::EXECUTIONS_FINISHED, &status_labels).inc();
        meter
            .histogram(metrics::EXECUTION_DURATION_MS)
            .observe(duration.as_secs_f64() * 1_000.0);

        match &outcome {
            Err(e) => {
                error!(status = %status, error = %e, ?duration, "execution failed");
                config.hooks.on_execution_finished(&execution_id, status);
                config.hooks.on_execution_error(&e.to_string());
            }
            Ok(result) => match result.error_message() {
                Some(message) => {
                    warn!(status = %status, error = %message, ?duration, "execution returned an error");
                    config.hooks.on_execution_finished(&execution_id, status);
                    config.hooks.on_execution_error(message);
                }
                None => {
                    info!(status = %status, ?duration, "execution finished");
                    if config.debug_mode {
                        debug!(result = ?result, "execution result");
                    }
                    config.hooks.on_result_received(result);
                    config.hooks.on_execution_finished(&execution_id, status);
                }
            },
        }

        // 7. Settle metering
        self.reports.finish(&session, self.local_peer_id(), duration).await;
    }
}
