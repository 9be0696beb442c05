//! Workflow engine.
//!
//! One [`Engine`] runs one workflow. Starting it launches three tasks that
//! share the engine's cancellation token:
//!
//! 1. a heartbeat,
//! 2. initialization: take a workflow slot, ask the module for its trigger
//!    subscriptions, register every trigger and spawn one listener each,
//! 3. the dispatcher: pop queued trigger events, drop stale ones, and run
//!    each remaining event as an execution under the concurrency limit.
//!
//! [`Engine::close`] stops all of them, waits for in-flight executions,
//! unregisters triggers and releases the workflow slot.

use std::sync::{Arc, OnceLock};

use donflow_core::ExecutionId;
use donflow_limits::{LimitError, ScopedPermit};
use donflow_metering::{ENGINE_VERSION, RegistryInfo, Reports};
use donflow_ports::{
    ExecuteRequest, ExecutionHelper, ExecutionResult, Node, RequestKind, RequestMetadata,
    TriggerRegistrationRequest, TriggerResponse,
};
use donflow_telemetry::{Labels, WorkflowEvent, labels, metrics};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::{EngineConfig, ValidatedConfig};
use crate::error::{EngineError, EngineResult, InitError};
use crate::helper::DisallowedExecutionHelper;
use crate::triggers::{EnqueuedTriggerEvent, TriggerRegistration, TriggerTable, registration_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Closed,
}

impl State {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Closed => "closed",
        }
    }
}

/// State shared by the engine handle and its tasks.
pub(crate) struct Shared {
    pub(crate) config: ValidatedConfig,
    /// Workflow identity tags.
    pub(crate) labels: Labels,
    pub(crate) reports: Reports,
    pub(crate) local_node: OnceLock<Node>,
    /// Guarded by the registration mutex.
    triggers: tokio::sync::Mutex<TriggerTable>,
    workflow_slot: parking_lot::Mutex<Option<ScopedPermit>>,
    /// Stops listeners, the dispatcher and the heartbeat.
    pub(crate) cancel: CancellationToken,
    /// Aborts in-flight executions once the shutdown timeout passes.
    pub(crate) execution_cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
    span: Span,
}

impl Shared {
    /// Metadata for requests made on behalf of the workflow.
    pub(crate) fn request_metadata(
        &self,
        execution_id: Option<&ExecutionId>,
        reference_id: String,
    ) -> RequestMetadata {
        RequestMetadata {
            workflow_id: self.config.workflow_id.to_string(),
            workflow_owner: self.config.workflow_owner.to_string(),
            workflow_execution_id: execution_id.map(ToString::to_string).unwrap_or_default(),
            workflow_name: self.config.workflow_name.clone(),
            workflow_tag: self.config.workflow_tag.clone(),
            workflow_don_id: self.local_node.get().map_or(0, |node| node.workflow_don.id),
            reference_id,
        }
    }

    pub(crate) fn local_peer_id(&self) -> &str {
        self.local_node.get().map_or("", |node| node.peer_id.as_str())
    }

    fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task.instrument(self.span.clone()));
    }

    async fn initialize(self: &Arc<Self>) -> Result<(), InitError> {
        // 1. Take a workflow slot
        {
            let mut slot = self.workflow_slot.lock();
            if self.cancel.is_cancelled() {
                return Err(InitError::ShuttingDown);
            }
            let permit = self
                .config
                .global_concurrency
                .try_use(&self.config.tenant, 1)
                .map_err(InitError::from_slot_rejection)?;
            *slot = Some(permit);
        }

        // 2. Resolve the node the workflow runs on
        let node = self.config.registry.local_node().await.map_err(InitError::LocalNode)?;
        let _ = self.local_node.set(node);

        // 3. Subscribe and register
        let trigger_ids = self.subscribe_to_triggers().await?;
        self.config.hooks.on_subscribed_to_triggers(&trigger_ids);
        Ok(())
    }

    /// Ask the module for its subscriptions and register every trigger.
    /// Either all triggers end up registered or none do.
    async fn subscribe_to_triggers(self: &Arc<Self>) -> Result<Vec<String>, InitError> {
        let config = &self.config;
        let limiters = &config.limiters;

        let helper: Arc<dyn ExecutionHelper> = Arc::new(DisallowedExecutionHelper::new(Arc::clone(&config.clock)));
        let request = ExecuteRequest {
            kind: RequestKind::Subscribe,
            config: config.workflow_config.clone(),
            max_response_size: limiters.execution_response.limit(),
        };
        let result = limiters
            .trigger_subscription_time
            .run(config.module.execute(request, helper))
            .await
            .map_err(|e| InitError::Subscribe(e.into()))?
            .map_err(InitError::Subscribe)?;
        let subscriptions = match result {
            ExecutionResult::TriggerSubscriptions(subscriptions) => subscriptions,
            other => {
                return Err(other
                    .error_message()
                    .map_or(InitError::NoSubscriptions, |msg| InitError::SubscribeRejected(msg.to_owned())));
            }
        };

        limiters
            .trigger_subscription
            .check(subscriptions.len() as u64)
            .map_err(InitError::TooManyTriggers)?;

        let mut capabilities = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let capability = config
                .registry
                .get_trigger(&subscription.id)
                .await
                .map_err(|source| InitError::TriggerNotFound {
                    trigger_id: subscription.id.clone(),
                    source,
                })?;
            capabilities.push(capability);
        }

        let mut table = self.triggers.lock().await;
        if self.cancel.is_cancelled() {
            return Err(InitError::ShuttingDown);
        }

        let workflow_id = config.workflow_id.to_string();
        let mut pending = TriggerTable::default();
        let mut channels: Vec<mpsc::Receiver<TriggerResponse>> = Vec::with_capacity(subscriptions.len());
        let mut current = 0;
        let outcome = limiters
            .trigger_registrations_time
            .run(async {
                for (i, (subscription, capability)) in subscriptions.iter().zip(&capabilities).enumerate() {
                    current = i;
                    let reg_id = registration_id(&workflow_id, i);
                    let request = TriggerRegistrationRequest {
                        trigger_id: reg_id.clone(),
                        method: subscription.method.clone(),
                        payload: subscription.payload.clone(),
                        metadata: self.request_metadata(None, format!("trigger_{i}")),
                    };
                    let events = capability.register_trigger(request).await?;
                    debug!(registration_id = %reg_id, trigger_id = %subscription.id, "trigger registered");
                    pending.insert(
                        i,
                        TriggerRegistration {
                            registration_id: reg_id,
                            trigger_id: subscription.id.clone(),
                            capability: Arc::clone(capability),
                            method: subscription.method.clone(),
                            payload: subscription.payload.clone(),
                        },
                    );
                    channels.push(events);
                }
                Ok::<(), donflow_ports::PortsError>(())
            })
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(source),
            Err(limit) => Some(limit.into()),
        };
        if let Some(source) = failure {
            let trigger_id = subscriptions[current].id.clone();
            error!(trigger_id = %trigger_id, error = %source, "trigger registration failed, rolling back");
            pending
                .unregister_all(&self.request_metadata(None, String::new()), config.telemetry.as_ref())
                .await;
            return Err(InitError::TriggerRegistration { trigger_id, source });
        }

        table.absorb(pending);
        let trigger_ids: Vec<String> = subscriptions.into_iter().map(|s| s.id).collect();
        for (index, events) in channels.into_iter().enumerate() {
            let shared = Arc::clone(self);
            let trigger_id = trigger_ids[index].clone();
            self.spawn(async move { shared.listen(trigger_id, index as u64, events).await });
        }
        info!(triggers = trigger_ids.len(), "subscribed to triggers");
        Ok(trigger_ids)
    }

    /// Forward one trigger's events into the queue until the channel closes.
    async fn listen(self: Arc<Self>, trigger_id: String, index: u64, mut events: mpsc::Receiver<TriggerResponse>) {
        let meter = self.config.telemetry.metrics();
        loop {
            let response = tokio::select! {
                () = self.cancel.cancelled() => return,
                response = events.recv() => response,
            };
            let Some(response) = response else {
                info!(trigger_id = %trigger_id, "trigger channel closed");
                return;
            };
            let event = match response {
                Ok(event) => event,
                Err(e) => {
                    error!(trigger_id = %trigger_id, error = %e, "trigger event error");
                    meter.counter(metrics::TRIGGER_EVENT_ERRORS).inc();
                    continue;
                }
            };
            meter.counter(metrics::TRIGGER_EVENTS_RECEIVED).inc();
            let queued = EnqueuedTriggerEvent {
                trigger_id: trigger_id.clone(),
                index,
                enqueued_at: self.config.clock.now(),
                event,
            };
            match self.config.limiters.trigger_event_queue.put(queued) {
                Ok(()) => {}
                Err(e @ LimitError::QueueFull { .. }) => {
                    error!(trigger_id = %trigger_id, error = %e, "trigger event queue full, dropping event");
                    meter.counter(metrics::TRIGGER_EVENT_QUEUE_FULL).inc();
                    self.config.telemetry.event_bus().emit(WorkflowEvent::TriggerEventDropped {
                        labels: self.labels.clone().with(labels::TRIGGER_ID, &trigger_id),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    debug!(trigger_id = %trigger_id, error = %e, "trigger event queue closed");
                    return;
                }
            }
        }
    }

    /// Run queued events until shutdown.
    async fn dispatch(self: Arc<Self>) {
        let limiters = &self.config.limiters;
        let meter = self.config.telemetry.metrics();
        let max_age = limiters.trigger_event_queue_time.limit();
        loop {
            let queued = tokio::select! {
                () = self.cancel.cancelled() => return,
                queued = limiters.trigger_event_queue.wait() => match queued {
                    Ok(queued) => queued,
                    Err(e) => {
                        debug!(error = %e, "trigger event queue closed");
                        return;
                    }
                },
            };

            let age = self.config.clock.now() - queued.enqueued_at;
            if age.to_std().is_ok_and(|age| age > max_age) {
                warn!(
                    trigger_id = %queued.trigger_id,
                    event_id = %queued.event.id,
                    age_ms = age.num_milliseconds(),
                    "discarding stale trigger event"
                );
                meter.counter(metrics::TRIGGER_EVENTS_STALE).inc();
                self.config.telemetry.event_bus().emit(WorkflowEvent::TriggerEventDropped {
                    labels: self.labels.clone().with(labels::TRIGGER_ID, &queued.trigger_id),
                    reason: format!("event is older than {max_age:?}"),
                });
                continue;
            }

            let permit = tokio::select! {
                () = self.cancel.cancelled() => return,
                permit = limiters.execution_concurrency.wait(1) => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        warn!(error = %e, "execution concurrency limiter closed");
                        return;
                    }
                },
            };
            let shared = Arc::clone(&self);
            self.spawn(async move {
                shared.execute(queued).await;
                permit.free();
            });
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let frequency = self.config.limits.heartbeat_frequency;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + frequency, frequency);
        let beats = self.config.telemetry.metrics().counter(metrics::ENGINE_HEARTBEATS);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    debug!("engine heartbeat");
                    beats.inc();
                    self.config.telemetry.event_bus().emit(WorkflowEvent::Heartbeat {
                        labels: self.labels.clone(),
                    });
                }
            }
        }
    }
}

/// A running workflow.
///
/// ```ignore
/// let engine = Engine::new(config)?;
/// engine.start()?;
/// // ...
/// engine.close().await?;
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    state: parking_lot::Mutex<State>,
}

impl Engine {
    /// Validate `config` and build an engine. Nothing runs until [`start`](Self::start).
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let config = config.validate()?;

        let labels = Labels::new()
            .with(labels::WORKFLOW_ID, config.workflow_id.to_string())
            .with(labels::WORKFLOW_OWNER, config.workflow_owner.to_string())
            .with(labels::WORKFLOW_NAME, &config.workflow_name)
            .with(labels::WORKFLOW_TAG, &config.workflow_tag);
        let reports = Reports::new(
            config.billing_client.clone(),
            Arc::clone(&config.telemetry),
            labels.clone(),
            RegistryInfo {
                address: config.registry_address.clone(),
                chain_selector: config.registry_chain_selector.clone(),
                engine_version: ENGINE_VERSION.to_owned(),
            },
        );
        let span = info_span!(
            "workflow",
            workflow_id = %config.workflow_id,
            workflow_owner = %config.workflow_owner,
            workflow_name = %config.workflow_name,
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                labels,
                reports,
                local_node: OnceLock::new(),
                triggers: tokio::sync::Mutex::new(TriggerTable::default()),
                workflow_slot: parking_lot::Mutex::new(None),
                cancel: CancellationToken::new(),
                execution_cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                span,
            }),
            state: parking_lot::Mutex::new(State::Created),
        })
    }

    /// Workflow identity tags.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.shared.labels
    }

    /// Start the heartbeat, initialization and dispatch tasks.
    ///
    /// Returns at once; the outcome of initialization is reported through
    /// [`LifecycleHooks::on_initialized`](crate::LifecycleHooks::on_initialized).
    /// Must be called within a Tokio runtime.
    pub fn start(&self) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            if *state != State::Created {
                return Err(EngineError::InvalidState {
                    state: state.as_str(),
                    action: "start",
                });
            }
            *state = State::Started;
        }

        let shared = &self.shared;
        shared.config.module.start();
        info!(parent: &shared.span, "starting engine");

        shared.spawn(Arc::clone(shared).heartbeat());
        let init = Arc::clone(shared);
        shared.spawn(async move {
            let result = init.initialize().await;
            match &result {
                Ok(()) => info!("engine initialized"),
                Err(e) => error!(error = %e, "engine initialization failed"),
            }
            init.config.hooks.on_initialized(&result);
        });
        shared.spawn(Arc::clone(shared).dispatch());
        Ok(())
    }

    /// Registration IDs of the live trigger registrations, in subscription order.
    pub async fn registered_triggers(&self) -> Vec<String> {
        self.shared.triggers.lock().await.ids()
    }

    /// Stop the engine.
    ///
    /// Waits for in-flight executions up to the shutdown timeout and cancels
    /// the rest, unregisters every trigger (failures are logged and
    /// counted), closes the module and returns the workflow slot. Closing
    /// the per-workflow limiters is the last step; its failure is the only
    /// error besides closing twice.
    pub async fn close(&self) -> EngineResult<()> {
        let previous = {
            let mut state = self.state.lock();
            if *state == State::Closed {
                return Err(EngineError::InvalidState {
                    state: state.as_str(),
                    action: "close",
                });
            }
            std::mem::replace(&mut *state, State::Closed)
        };
        let shared = &self.shared;
        let config = &shared.config;

        async {
            info!("closing engine");
            shared.cancel.cancel();
            shared.tracker.close();
            if tokio::time::timeout(config.limits.shutdown_timeout, shared.tracker.wait())
                .await
                .is_err()
            {
                warn!(
                    timeout = ?config.limits.shutdown_timeout,
                    "executions still running after shutdown timeout, cancelling them"
                );
                shared.execution_cancel.cancel();
                shared.tracker.wait().await;
            }

            let mut table = shared.triggers.lock().await;
            if !table.is_empty() {
                table
                    .unregister_all(&shared.request_metadata(None, String::new()), config.telemetry.as_ref())
                    .await;
            }
            drop(table);

            if previous == State::Started {
                config.module.close();
            }
            config.telemetry.metrics().gauge(metrics::METERING_MODE).set(0);
            if let Some(slot) = shared.workflow_slot.lock().take() {
                slot.free();
            }
            info!("engine closed");
        }
        .instrument(shared.span.clone())
        .await;

        config.limiters.close()?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.execution_cancel.cancel();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflow_id", &self.shared.config.workflow_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
