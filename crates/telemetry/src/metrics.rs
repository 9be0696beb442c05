//! Metrics primitives and registry.
//!
//! Lightweight counters, gauges, and histograms stored in memory with atomics.
//! Each engine owns its own series; cross-engine aggregation is the
//! exporter's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::labels::Labels;

/// Trigger events received by listeners.
pub const TRIGGER_EVENTS_RECEIVED: &str = "engine_trigger_events_received_total";
/// Trigger events whose delivery carried an error.
pub const TRIGGER_EVENT_ERRORS: &str = "engine_trigger_event_errors_total";
/// Trigger events rejected by a full queue.
pub const TRIGGER_EVENT_QUEUE_FULL: &str = "engine_trigger_event_queue_full_total";
/// Trigger events discarded for age.
pub const TRIGGER_EVENTS_STALE: &str = "engine_trigger_events_stale_total";
/// Executions in flight.
pub const EXECUTIONS_IN_FLIGHT: &str = "engine_executions_in_flight";
/// Executions finished, labelled by status.
pub const EXECUTIONS_FINISHED: &str = "engine_executions_finished_total";
/// Execution duration in milliseconds.
pub const EXECUTION_DURATION_MS: &str = "engine_execution_duration_ms";
/// Trigger unregistration failures.
pub const TRIGGER_UNREGISTER_ERRORS: &str = "engine_trigger_unregister_errors_total";
/// User log lines dropped over the per-execution cap.
pub const USER_LOGS_DROPPED: &str = "engine_user_logs_dropped_total";
/// Whether the engine runs reports in metering-only mode (0 or 1).
pub const METERING_MODE: &str = "engine_metering_mode";
/// Metering reports that could not be emitted or submitted.
pub const METERING_REPORTS_MISSING: &str = "engine_metering_reports_missing_total";
/// Engine heartbeat ticks.
pub const ENGINE_HEARTBEATS: &str = "engine_heartbeats_total";
/// Secrets fetch duration in milliseconds.
pub const SECRETS_FETCH_DURATION_MS: &str = "secrets_fetch_duration_ms";

/// An incrementing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Create a new counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by a given amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up and down.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicI64>,
}

impl Gauge {
    /// Create a new gauge starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Set to a specific value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram that keeps every observation.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    observations: Arc<Mutex<Vec<f64>>>,
}

impl Histogram {
    /// Create a new histogram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation.
    pub fn observe(&self, value: f64) {
        self.observations.lock().push(value);
    }

    /// Number of observations recorded.
    #[must_use]
    pub fn count(&self) -> usize {
        self.observations.lock().len()
    }

    /// Sum of all observations.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.observations.lock().iter().sum()
    }
}

fn series(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        name.to_owned()
    } else {
        format!("{name}{labels}")
    }
}

/// Registry for creating and retrieving named metrics.
///
/// # Examples
///
/// ```
/// use donflow_telemetry::{Labels, MetricsRegistry};
///
/// let registry = MetricsRegistry::new();
/// let labels = Labels::new().with("status", "completed");
/// registry.counter_with("executions_total", &labels).inc();
///
/// // Retrieving the same series returns the same metric.
/// assert_eq!(registry.counter_with("executions_total", &labels).get(), 1);
/// assert_eq!(registry.counter("executions_total").get(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, Counter>>>,
    gauges: Arc<RwLock<HashMap<String, Gauge>>>,
    histograms: Arc<RwLock<HashMap<String, Histogram>>>,
}

impl MetricsRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create an unlabelled counter.
    pub fn counter(&self, name: &str) -> Counter {
        self.counter_with(name, &Labels::new())
    }

    /// Get or create a labelled counter.
    pub fn counter_with(&self, name: &str, labels: &Labels) -> Counter {
        self.counters
            .write()
            .entry(series(name, labels))
            .or_default()
            .clone()
    }

    /// Get or create an unlabelled gauge.
    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauge_with(name, &Labels::new())
    }

    /// Get or create a labelled gauge.
    pub fn gauge_with(&self, name: &str, labels: &Labels) -> Gauge {
        self.gauges
            .write()
            .entry(series(name, labels))
            .or_default()
            .clone()
    }

    /// Get or create an unlabelled histogram.
    pub fn histogram(&self, name: &str) -> Histogram {
        self.histogram_with(name, &Labels::new())
    }

    /// Get or create a labelled histogram.
    pub fn histogram_with(&self, name: &str, labels: &Labels) -> Histogram {
        self.histograms
            .write()
            .entry(series(name, labels))
            .or_default()
            .clone()
    }
}
