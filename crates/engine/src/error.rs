//! Engine error types.

use donflow_core::CoreError;
use donflow_limits::LimitError;
use donflow_ports::PortsError;
use thiserror::Error;

/// A missing or malformed [`EngineConfig`](crate::EngineConfig) field.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No module was given.
    #[error("module not set")]
    ModuleNotSet,

    /// No capabilities registry was given.
    #[error("capabilities registry not set")]
    RegistryNotSet,

    /// DON time is required but no provider was given.
    #[error("DON time provider not set")]
    DonTimeNotSet,

    /// The workflow ID is not 32 hex-encoded bytes.
    #[error("invalid workflow ID: {0}")]
    InvalidWorkflowId(#[source] CoreError),

    /// The workflow owner is not 20 hex-encoded bytes.
    #[error("invalid workflow owner: {0}")]
    InvalidWorkflowOwner(#[source] CoreError),

    /// The workflow name is empty.
    #[error("workflow name not set")]
    WorkflowNameNotSet,

    /// No per-workflow limiter set was given.
    #[error("engine limiters not set")]
    LimitersNotSet,

    /// No global execution concurrency limiter was given.
    #[error("execution concurrency limiter not set")]
    ConcurrencyLimiterNotSet,

    /// No global execution rate limiter was given.
    #[error("execution rate limiter not set")]
    RateLimiterNotSet,

    /// Secrets cannot be fetched: neither a fetcher nor a workflow key was given.
    #[error("workflow encryption key not set")]
    EncryptionKeyNotSet,
}

/// Why an engine failed to initialize. Reported through
/// [`LifecycleHooks::on_initialized`](crate::LifecycleHooks::on_initialized).
#[derive(Debug, Error)]
pub enum InitError {
    /// The owner already runs as many workflows as allowed.
    #[error("per owner workflow count limit reached")]
    PerOwnerWorkflowCountLimit(#[source] LimitError),

    /// The node already runs as many workflows as allowed.
    #[error("global workflow count limit reached")]
    GlobalWorkflowCountLimit(#[source] LimitError),

    /// The workflow slot could not be taken for another reason.
    #[error("failed to take a workflow slot: {0}")]
    WorkflowSlot(#[source] LimitError),

    /// The local node could not be resolved.
    #[error("failed to get local node: {0}")]
    LocalNode(#[source] PortsError),

    /// The module failed to answer the subscribe request.
    #[error("failed to execute subscribe: {0}")]
    Subscribe(#[source] PortsError),

    /// The module answered the subscribe request with an error.
    #[error("failed to execute subscribe: {0}")]
    SubscribeRejected(String),

    /// The module answered the subscribe request with something other than subscriptions.
    #[error("subscribe result carries no trigger subscriptions")]
    NoSubscriptions,

    /// The module asked for more subscriptions than allowed.
    #[error(transparent)]
    TooManyTriggers(LimitError),

    /// A requested trigger is not in the registry.
    #[error("failed to resolve trigger {trigger_id}: {source}")]
    TriggerNotFound {
        /// Capability ID that was looked up.
        trigger_id: String,
        /// Registry error.
        #[source]
        source: PortsError,
    },

    /// Registering with a trigger failed; every registration was rolled back.
    #[error("failed to register trigger {trigger_id}: {source}")]
    TriggerRegistration {
        /// Capability ID whose registration failed.
        trigger_id: String,
        /// Trigger error.
        #[source]
        source: PortsError,
    },

    /// The engine was closed before initialization finished.
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl InitError {
    /// Map a workflow slot rejection to the scope that ran out.
    pub fn from_slot_rejection(err: LimitError) -> Self {
        use donflow_core::Scope;
        match err.scope() {
            Some(Scope::Owner) => Self::PerOwnerWorkflowCountLimit(err),
            Some(Scope::Global) => Self::GlobalWorkflowCountLimit(err),
            _ => Self::WorkflowSlot(err),
        }
    }
}

/// Errors from constructing and driving an [`Engine`](crate::Engine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration is invalid.
    #[error("invalid engine config: {0}")]
    Config(#[from] ConfigError),

    /// A limiter could not be built or closed.
    #[error(transparent)]
    Limit(#[from] LimitError),

    /// The lifecycle call is not valid in the engine's current state.
    #[error("engine is {state}, cannot {action}")]
    InvalidState {
        /// Current state.
        state: &'static str,
        /// Attempted call.
        action: &'static str,
    },
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
