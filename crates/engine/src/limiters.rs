//! Per-workflow limiter set.

use std::sync::Arc;

use donflow_core::Tenant;
use donflow_limits::{
    BoundLimiter, Factory, LimitResult, Limiter, QueueLimiter, ResourcePoolLimiter, TimeLimiter,
    WorkflowSettings, close_all,
};
use donflow_limits::settings::PerWorkflowSettings;

use crate::triggers::EnqueuedTriggerEvent;

/// Every quota one engine enforces for its workflow.
///
/// Pools and the queue are shared with the tasks that wait on them.
pub struct EngineLimiters {
    /// Largest execution response, in bytes.
    pub execution_response: BoundLimiter,
    /// Deadline for the module subscribe call.
    pub trigger_subscription_time: TimeLimiter,
    /// Deadline for registering every trigger.
    pub trigger_registrations_time: TimeLimiter,
    /// Number of trigger subscriptions.
    pub trigger_subscription: BoundLimiter,
    /// Queue between trigger listeners and the dispatcher.
    pub trigger_event_queue: Arc<QueueLimiter<EnqueuedTriggerEvent>>,
    /// Age after which a queued event is discarded.
    pub trigger_event_queue_time: TimeLimiter,
    /// Concurrent executions.
    pub execution_concurrency: Arc<ResourcePoolLimiter>,
    /// Uncompressed module binary size.
    pub wasm_binary_size: BoundLimiter,
    /// Module memory.
    pub wasm_memory_size: BoundLimiter,
    /// Compressed module binary size.
    pub wasm_compressed_binary_size: BoundLimiter,
    /// Module response size.
    pub wasm_response_size: BoundLimiter,
    /// Concurrent capability calls.
    pub capability_concurrency: Arc<ResourcePoolLimiter>,
    /// Concurrent secrets fetches.
    pub secrets_concurrency: Arc<ResourcePoolLimiter>,
    /// Deadline for one execution.
    pub execution_time: TimeLimiter,
    /// Deadline for one capability call.
    pub capability_call_time: TimeLimiter,
    /// User log lines per execution.
    pub log_event: BoundLimiter,
    /// Length of one user log line.
    pub log_line: BoundLimiter,
    /// Chain write calls per execution.
    pub chain_write_targets: BoundLimiter,
    /// Chain read calls per execution.
    pub chain_read_calls: BoundLimiter,
    /// Consensus calls per execution.
    pub consensus_calls: BoundLimiter,
    /// HTTP action calls per execution.
    pub http_action_calls: BoundLimiter,
}

impl EngineLimiters {
    /// Build the set for `tenant` from the default settings after `configure`
    /// has adjusted them. The first limiter that fails to build aborts.
    pub fn new(
        factory: &Factory,
        tenant: &Tenant,
        configure: impl FnOnce(&mut PerWorkflowSettings),
    ) -> LimitResult<Self> {
        let mut settings = WorkflowSettings::default().per_workflow;
        configure(&mut settings);
        let s = &settings;

        Ok(Self {
            execution_response: factory.bound(&s.execution_response_limit, tenant)?,
            trigger_subscription_time: factory.time(&s.trigger_subscription_timeout, tenant)?,
            trigger_registrations_time: factory.time(&s.trigger_registrations_timeout, tenant)?,
            trigger_subscription: factory.bound(&s.trigger_subscription_limit, tenant)?,
            trigger_event_queue: Arc::new(factory.queue(&s.trigger_event_queue_limit, tenant)?),
            trigger_event_queue_time: factory.time(&s.trigger_event_queue_timeout, tenant)?,
            execution_concurrency: Arc::new(
                factory.resource_pool(&s.execution_concurrency_limit, tenant)?,
            ),
            wasm_binary_size: factory.bound(&s.wasm_binary_size_limit, tenant)?,
            wasm_memory_size: factory.bound(&s.wasm_memory_limit, tenant)?,
            wasm_compressed_binary_size: factory
                .bound(&s.wasm_compressed_binary_size_limit, tenant)?,
            wasm_response_size: factory.bound(&s.wasm_response_size_limit, tenant)?,
            capability_concurrency: Arc::new(
                factory.resource_pool(&s.capability_concurrency_limit, tenant)?,
            ),
            secrets_concurrency: Arc::new(
                factory.resource_pool(&s.secrets_concurrency_limit, tenant)?,
            ),
            execution_time: factory.time(&s.execution_timeout, tenant)?,
            capability_call_time: factory.time(&s.capability_call_timeout, tenant)?,
            log_event: factory.bound(&s.log_event_limit, tenant)?,
            log_line: factory.bound(&s.log_line_limit, tenant)?,
            chain_write_targets: factory.bound(&s.chain_write_target_limit, tenant)?,
            chain_read_calls: factory.bound(&s.chain_read_call_limit, tenant)?,
            consensus_calls: factory.bound(&s.consensus_call_limit, tenant)?,
            http_action_calls: factory.bound(&s.http_action_call_limit, tenant)?,
        })
    }

    /// Build the set with unmodified default settings.
    pub fn with_defaults(factory: &Factory, tenant: &Tenant) -> LimitResult<Self> {
        Self::new(factory, tenant, |_| {})
    }

    /// Close every limiter, continuing past failures.
    pub fn close(&self) -> LimitResult<()> {
        close_all(&[
            &self.execution_response,
            &self.trigger_subscription_time,
            &self.trigger_registrations_time,
            &self.trigger_subscription,
            self.trigger_event_queue.as_ref(),
            &self.trigger_event_queue_time,
            self.execution_concurrency.as_ref(),
            &self.wasm_binary_size,
            &self.wasm_memory_size,
            &self.wasm_compressed_binary_size,
            &self.wasm_response_size,
            self.capability_concurrency.as_ref(),
            self.secrets_concurrency.as_ref(),
            &self.execution_time,
            &self.capability_call_time,
            &self.log_event,
            &self.log_line,
            &self.chain_write_targets,
            &self.chain_read_calls,
            &self.consensus_calls,
            &self.http_action_calls,
        ])
    }
}

impl std::fmt::Debug for EngineLimiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLimiters")
            .field("execution_concurrency", &self.execution_concurrency.limit())
            .field("trigger_event_queue", &self.trigger_event_queue.capacity())
            .field("execution_time", &self.execution_time.limit())
            .finish_non_exhaustive()
    }
}
