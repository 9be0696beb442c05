//! Lifecycle callbacks for engine hosts.

use std::fmt;

use donflow_core::ExecutionId;
use donflow_ports::ExecutionResult;

use crate::error::InitError;

/// Final state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    /// The module returned a value.
    Completed,
    /// The module or the engine failed, or the module reported an in-band error.
    Errored,
    /// The execution deadline passed.
    Timeout,
}

impl ExecutionStatus {
    /// Label value used in events and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callbacks fired at engine milestones.
///
/// Every method defaults to a no-op; implement only what you observe.
/// Callbacks run on engine tasks and must not block.
pub trait LifecycleHooks: Send + Sync {
    /// Initialization finished, successfully or not.
    fn on_initialized(&self, _result: &Result<(), InitError>) {}

    /// Every trigger was registered; IDs are in subscription order.
    fn on_subscribed_to_triggers(&self, _trigger_ids: &[String]) {}

    /// An execution reached a final status.
    fn on_execution_finished(&self, _execution_id: &ExecutionId, _status: ExecutionStatus) {}

    /// An execution failed.
    fn on_execution_error(&self, _message: &str) {}

    /// An execution produced a result.
    fn on_result_received(&self, _result: &ExecutionResult) {}

    /// A trigger event was rejected by the execution rate limit.
    fn on_rate_limited(&self, _execution_id: &ExecutionId) {}
}

/// Hooks that ignore every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}
