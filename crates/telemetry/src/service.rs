//! Telemetry service trait and implementations.
//!
//! [`TelemetryService`] is the facade the engine, metering, and secrets
//! crates emit through. It provides access to the event bus and metrics
//! registry.

use std::sync::Arc;

use crate::event::EventBus;
use crate::metrics::MetricsRegistry;

/// Telemetry service facade.
///
/// Shared via `Arc<dyn TelemetryService>` across the engine and its
/// collaborators.
pub trait TelemetryService: Send + Sync {
    /// Access the event bus for emitting and subscribing to events.
    fn event_bus(&self) -> &EventBus;

    /// Access the metrics registry for recording metrics.
    fn metrics(&self) -> &MetricsRegistry;
}

/// In-process telemetry.
///
/// Events reach whoever subscribes to the bus; metrics stay in memory.
/// Hosts with a real sink subscribe and forward.
///
/// # Examples
///
/// ```
/// use donflow_telemetry::{InMemoryTelemetry, TelemetryService};
///
/// let telemetry = InMemoryTelemetry::new();
/// let counter = telemetry.metrics().counter("test");
/// counter.inc();
/// assert_eq!(counter.get(), 1);
/// ```
#[derive(Debug)]
pub struct InMemoryTelemetry {
    event_bus: EventBus,
    metrics: MetricsRegistry,
}

impl InMemoryTelemetry {
    /// Create a new in-memory telemetry service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_bus: EventBus::new(1024),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Create as an `Arc<dyn TelemetryService>` for dependency injection.
    #[must_use]
    pub fn arc() -> Arc<dyn TelemetryService> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryService for InMemoryTelemetry {
    fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WorkflowEvent;
    use crate::labels::Labels;

    #[test]
    fn in_memory_telemetry_delivers_to_subscribers() {
        let telemetry = InMemoryTelemetry::new();
        let mut sub = telemetry.event_bus().subscribe();
        telemetry.event_bus().emit(WorkflowEvent::Heartbeat {
            labels: Labels::new(),
        });
        telemetry.metrics().gauge("active").set(5);
        assert!(sub.try_recv().is_some());
        assert_eq!(telemetry.metrics().gauge("active").get(), 5);
    }

    #[test]
    fn telemetry_arc_is_object_safe() {
        let t: Arc<dyn TelemetryService> = InMemoryTelemetry::arc();
        t.metrics().counter("x").inc();
    }
}
