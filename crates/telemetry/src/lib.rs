#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # donflow Telemetry
//!
//! Event bus, labelled workflow events, and metrics for the donflow engine.
//!
//! This crate provides:
//! - [`EventBus`] -- broadcast-based event distribution
//! - [`WorkflowEvent`] -- execution, user-log, metering, and heartbeat events
//! - [`Labels`] -- workflow/owner/execution tags attached to every event
//! - [`TelemetryService`] trait -- pluggable telemetry backend
//! - [`InMemoryTelemetry`] -- in-process implementation for tests and embedding
//!
//! Events are fire-and-forget projections; the host owns the sink.

pub mod event;
pub mod labels;
pub mod metrics;
pub mod service;

pub use event::{EventBus, EventSubscriber, WorkflowEvent};
pub use labels::Labels;
pub use metrics::{Counter, Gauge, Histogram, MetricsRegistry};
pub use service::{InMemoryTelemetry, TelemetryService};
