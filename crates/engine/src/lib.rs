#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # donflow Engine
//!
//! Runs one workflow module against the triggers it subscribes to.
//!
//! An [`Engine`] is built from an [`EngineConfig`], started, and closed:
//!
//! - **Init** takes a workflow slot from the node-wide limiter, asks the
//!   module for its trigger subscriptions and registers every trigger. A
//!   failed registration rolls back the ones before it.
//! - **Dispatch** pulls trigger events from a bounded queue, drops events
//!   older than the queue age limit and runs the rest under the execution
//!   concurrency limit.
//! - **Executions** are metered, bounded by the execution timeout, and given
//!   an execution helper for capability calls, secrets, DON time and user
//!   logs.
//!
//! Milestones are reported through [`LifecycleHooks`], telemetry events and
//! metrics.

pub mod config;
mod engine;
pub mod error;
mod execution;
mod helper;
pub mod hooks;
pub mod limiters;
pub mod time;
pub mod triggers;
mod user_logs;

pub use config::{EngineConfig, EngineLimits, ValidatedConfig};
pub use engine::Engine;
pub use error::{ConfigError, EngineError, EngineResult, InitError};
pub use hooks::{ExecutionStatus, LifecycleHooks, NoopHooks};
pub use limiters::EngineLimiters;
pub use time::LocalTimeProvider;
pub use triggers::EnqueuedTriggerEvent;
pub use user_logs::TRUNCATION_MARKER;
