//! Trigger registrations and the events they deliver.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use donflow_ports::{RequestMetadata, TriggerCapability, TriggerEvent, TriggerRegistrationRequest};
use donflow_telemetry::{TelemetryService, metrics};
use tracing::{error, info};

/// A trigger event waiting in the engine queue.
#[derive(Debug, Clone)]
pub struct EnqueuedTriggerEvent {
    /// Capability ID of the trigger that fired.
    pub trigger_id: String,
    /// Position of the trigger in the module's subscriptions.
    pub index: u64,
    /// When the event entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// The event itself.
    pub event: TriggerEvent,
}

/// One live registration with a trigger capability.
pub(crate) struct TriggerRegistration {
    pub(crate) registration_id: String,
    pub(crate) trigger_id: String,
    pub(crate) capability: Arc<dyn TriggerCapability>,
    pub(crate) method: String,
    pub(crate) payload: serde_json::Value,
}

/// Registrations keyed by subscription index.
///
/// Only touched while holding the engine's registration mutex.
#[derive(Default)]
pub(crate) struct TriggerTable {
    registrations: BTreeMap<usize, TriggerRegistration>,
}

impl TriggerTable {
    pub(crate) fn insert(&mut self, index: usize, registration: TriggerRegistration) {
        self.registrations.insert(index, registration);
    }

    /// Move every registration of `other` into this table.
    pub(crate) fn absorb(&mut self, other: Self) {
        self.registrations.extend(other.registrations);
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.registrations
            .values()
            .map(|registration| registration.registration_id.clone())
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Unregister every trigger, continuing past failures, and empty the table.
    ///
    /// Returns the number of failed unregistrations.
    pub(crate) async fn unregister_all(
        &mut self,
        metadata: &RequestMetadata,
        telemetry: &dyn TelemetryService,
    ) -> usize {
        let registrations = std::mem::take(&mut self.registrations);
        let total = registrations.len();
        let mut failed = 0;
        for registration in registrations.into_values() {
            let registration_id = registration.registration_id;
            let request = TriggerRegistrationRequest {
                trigger_id: registration_id.clone(),
                method: registration.method,
                payload: registration.payload,
                metadata: metadata.clone(),
            };
            if let Err(e) = registration.capability.unregister_trigger(request).await {
                error!(
                    registration_id = %registration_id,
                    trigger_id = %registration.trigger_id,
                    error = %e,
                    "failed to unregister trigger"
                );
                telemetry.metrics().counter(metrics::TRIGGER_UNREGISTER_ERRORS).inc();
                failed += 1;
            }
        }
        info!(triggers = total, failed, "all triggers unregistered");
        failed
    }
}

/// Registration ID of the `index`-th subscription of a workflow.
pub(crate) fn registration_id(workflow_id: &str, index: usize) -> String {
    format!("trigger_reg_{workflow_id}_{index}")
}
