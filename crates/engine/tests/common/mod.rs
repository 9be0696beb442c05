//! Fakes shared by the engine integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use donflow_core::{ExecutionId, Tenant};
use donflow_engine::{
    EngineConfig, EngineLimiters, ExecutionStatus, InitError, LifecycleHooks,
};
use donflow_limits::settings::PerWorkflowSettings;
use donflow_limits::{Factory, Rate, ScopedRateLimiter, ScopedResourceLimiter};
use donflow_ports::{
    CapabilitiesRegistry, CapabilityConfiguration, CapabilityInfo, CapabilityRequest,
    CapabilityResponse, CapabilityType, Don, ExecutableCapability, ExecuteRequest,
    ExecutionHelper, ExecutionResult, GetSecretsRequest, Node, PortsError, RequestKind,
    RequestMetadata, ResponseMetadata, SecretRequest, SecretResponse, SecretsFetcher,
    TriggerCapability, TriggerEvent, TriggerRegistrationRequest, TriggerResponse,
    TriggerSubscription,
};
use donflow_telemetry::InMemoryTelemetry;
use tokio::sync::{Semaphore, mpsc};

pub const WORKFLOW_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const OTHER_WORKFLOW_ID: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
pub const OWNER: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub const OTHER_OWNER: &str = "dddddddddddddddddddddddddddddddddddddddd";
pub const CRON: &str = "cron-trigger@1.0.0";
pub const HTTP_TRIGGER: &str = "http-trigger@1.0.0";

const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// One recorded hook call.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    Initialized(Result<(), String>),
    Subscribed(Vec<String>),
    Finished(ExecutionId, ExecutionStatus),
    Error(String),
    Result(ExecutionResult),
    RateLimited(ExecutionId),
}

pub struct RecordingHooks {
    tx: mpsc::UnboundedSender<HookEvent>,
}

impl RecordingHooks {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HookEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn record(&self, event: HookEvent) {
        let _ = self.tx.send(event);
    }
}

impl LifecycleHooks for RecordingHooks {
    fn on_initialized(&self, result: &Result<(), InitError>) {
        self.record(HookEvent::Initialized(result.as_ref().map(|_| ()).map_err(ToString::to_string)));
    }

    fn on_subscribed_to_triggers(&self, trigger_ids: &[String]) {
        self.record(HookEvent::Subscribed(trigger_ids.to_vec()));
    }

    fn on_execution_finished(&self, execution_id: &ExecutionId, status: ExecutionStatus) {
        self.record(HookEvent::Finished(execution_id.clone(), status));
    }

    fn on_execution_error(&self, message: &str) {
        self.record(HookEvent::Error(message.to_owned()));
    }

    fn on_result_received(&self, result: &ExecutionResult) {
        self.record(HookEvent::Result(result.clone()));
    }

    fn on_rate_limited(&self, execution_id: &ExecutionId) {
        self.record(HookEvent::RateLimited(execution_id.clone()));
    }
}

/// Next hook call, failing the test if none arrives.
pub async fn next_hook(rx: &mut mpsc::UnboundedReceiver<HookEvent>) -> HookEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a hook")
        .expect("hook channel closed")
}

/// Skip hook calls until one matches.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<HookEvent>,
    matches: impl Fn(&HookEvent) -> bool,
) -> HookEvent {
    loop {
        let event = next_hook(rx).await;
        if matches(&event) {
            return event;
        }
    }
}

pub async fn wait_initialized(rx: &mut mpsc::UnboundedReceiver<HookEvent>) -> Result<(), String> {
    match wait_for(rx, |e| matches!(e, HookEvent::Initialized(_))).await {
        HookEvent::Initialized(result) => result,
        _ => unreachable!(),
    }
}

/// Collect `n` finished executions.
pub async fn finished(
    rx: &mut mpsc::UnboundedReceiver<HookEvent>,
    n: usize,
) -> Vec<(ExecutionId, ExecutionStatus)> {
    let mut out = Vec::new();
    while out.len() < n {
        if let HookEvent::Finished(id, status) = next_hook(rx).await {
            out.push((id, status));
        }
    }
    out
}

/// Poll `condition` until it holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

/// What the fake module does when a trigger fires.
#[derive(Clone)]
pub enum Behavior {
    /// Return the `msg` field of the payload.
    Echo,
    /// Fail outside the program.
    Fail,
    /// Report an in-band error.
    InBandError,
    /// Sleep, then return `null`.
    Sleep(Duration),
    /// Wait for a gate permit, then return `null`.
    Gate(Arc<Semaphore>),
    /// Write the lines to the user log.
    Log(Vec<String>),
    /// Call the capability `times` times and return the last payload.
    Call { capability_id: String, times: usize },
    /// Fetch one secret and return its value.
    Secret(String),
}

pub struct TestModule {
    subscriptions: Vec<TriggerSubscription>,
    behavior: Behavior,
    call_during_subscribe: bool,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub started: AtomicUsize,
    pub closed: AtomicUsize,
}

impl TestModule {
    pub fn new(trigger_ids: &[&str], behavior: Behavior) -> Self {
        Self {
            subscriptions: trigger_ids
                .iter()
                .map(|id| TriggerSubscription {
                    id: (*id).to_owned(),
                    method: "Trigger".to_owned(),
                    payload: serde_json::json!({ "schedule": "*/30 * * * * *" }),
                })
                .collect(),
            behavior,
            call_during_subscribe: false,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn calling_during_subscribe(mut self) -> Self {
        self.call_during_subscribe = true;
        self
    }

    async fn run(
        &self,
        payload: serde_json::Value,
        helper: Arc<dyn ExecutionHelper>,
    ) -> Result<ExecutionResult, PortsError> {
        match &self.behavior {
            Behavior::Echo => Ok(ExecutionResult::Value(payload["msg"].clone())),
            Behavior::Fail => Err(PortsError::Module("wasm trap: unreachable".into())),
            Behavior::InBandError => Ok(ExecutionResult::Error("bad input".into())),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(ExecutionResult::Value(serde_json::Value::Null))
            }
            Behavior::Gate(gate) => {
                let _permit = gate.acquire().await.expect("gate closed");
                Ok(ExecutionResult::Value(serde_json::Value::Null))
            }
            Behavior::Log(lines) => {
                for line in lines {
                    helper.emit_user_log(line.clone());
                }
                Ok(ExecutionResult::Value(serde_json::Value::Null))
            }
            Behavior::Call { capability_id, times } => {
                let mut last = serde_json::Value::Null;
                for _ in 0..*times {
                    let response = helper
                        .call_capability(CapabilityRequest {
                            capability_id: capability_id.clone(),
                            method: "SendRequest".to_owned(),
                            payload: payload.clone(),
                            config: serde_json::Value::Null,
                            metadata: RequestMetadata::default(),
                        })
                        .await?;
                    last = response.payload;
                }
                Ok(ExecutionResult::Value(last))
            }
            Behavior::Secret(id) => {
                let responses = helper
                    .get_secrets(GetSecretsRequest {
                        requests: vec![SecretRequest::new(id.clone(), "")],
                        callback_id: 0,
                    })
                    .await?;
                let value = responses
                    .into_iter()
                    .next()
                    .and_then(|r| r.result.ok())
                    .unwrap_or_default();
                Ok(ExecutionResult::Value(serde_json::Value::String(value)))
            }
        }
    }
}

#[async_trait]
impl donflow_ports::Module for TestModule {
    fn start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        helper: Arc<dyn ExecutionHelper>,
    ) -> Result<ExecutionResult, PortsError> {
        match request.kind {
            RequestKind::Subscribe => {
                assert!(helper.execution_id().is_none());
                if self.call_during_subscribe {
                    helper
                        .call_capability(CapabilityRequest {
                            capability_id: "http-actions@1.0.0".to_owned(),
                            method: "SendRequest".to_owned(),
                            payload: serde_json::Value::Null,
                            config: serde_json::Value::Null,
                            metadata: RequestMetadata::default(),
                        })
                        .await?;
                }
                Ok(ExecutionResult::TriggerSubscriptions(self.subscriptions.clone()))
            }
            RequestKind::Trigger { payload, .. } => {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_running.fetch_max(now, Ordering::SeqCst);
                let result = self.run(payload, helper).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Triggers and registry
// ---------------------------------------------------------------------------

pub struct FakeTrigger {
    id: String,
    fail_register: bool,
    senders: Mutex<Vec<mpsc::Sender<TriggerResponse>>>,
    pub registered: Mutex<Vec<RequestMetadata>>,
    pub registration_ids: Mutex<Vec<String>>,
    pub unregistered: Mutex<Vec<String>>,
}

impl FakeTrigger {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, false))
    }

    pub fn failing(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, true))
    }

    fn build(id: &str, fail_register: bool) -> Self {
        Self {
            id: id.to_owned(),
            fail_register,
            senders: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            registration_ids: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
        }
    }

    /// Deliver an event to the latest registration.
    pub async fn fire(&self, event_id: &str, payload: serde_json::Value) {
        let sender = self.senders.lock().unwrap().last().cloned().expect("trigger not registered");
        sender
            .send(Ok(TriggerEvent {
                trigger_type: self.id.clone(),
                id: event_id.to_owned(),
                payload,
            }))
            .await
            .expect("listener gone");
    }

    /// Deliver a delivery error to the latest registration.
    pub async fn fail(&self, message: &str) {
        let sender = self.senders.lock().unwrap().last().cloned().expect("trigger not registered");
        sender
            .send(Err(PortsError::capability(&self.id, message)))
            .await
            .expect("listener gone");
    }

    pub fn registration_ids(&self) -> Vec<String> {
        self.registration_ids.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Vec<String> {
        self.unregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl TriggerCapability for FakeTrigger {
    async fn info(&self) -> Result<CapabilityInfo, PortsError> {
        Ok(CapabilityInfo {
            id: self.id.clone(),
            capability_type: CapabilityType::Trigger,
            is_local: true,
            don: None,
        })
    }

    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>, PortsError> {
        if self.fail_register {
            return Err(PortsError::capability(&self.id, "registration refused"));
        }
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().push(tx);
        self.registration_ids.lock().unwrap().push(request.trigger_id);
        self.registered.lock().unwrap().push(request.metadata);
        Ok(rx)
    }

    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<(), PortsError> {
        self.unregistered.lock().unwrap().push(request.trigger_id);
        Ok(())
    }
}

/// Executable capability answering with its request payload.
pub struct EchoCapability {
    id: String,
    pub calls: AtomicUsize,
}

impl EchoCapability {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ExecutableCapability for EchoCapability {
    async fn info(&self) -> Result<CapabilityInfo, PortsError> {
        Ok(CapabilityInfo {
            id: self.id.clone(),
            capability_type: CapabilityType::Action,
            is_local: false,
            don: Some(local_node().workflow_don),
        })
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse, PortsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.metadata.workflow_id, WORKFLOW_ID);
        assert!(!request.metadata.workflow_execution_id.is_empty());
        Ok(CapabilityResponse {
            payload: request.payload,
            metadata: ResponseMetadata::default(),
        })
    }
}

pub fn local_node() -> Node {
    Node {
        peer_id: "peer-1".to_owned(),
        workflow_don: Don {
            id: 1,
            members: vec!["peer-1".to_owned(), "peer-2".to_owned(), "peer-3".to_owned()],
            f: 1,
        },
        encryption_public_key: [0; 32],
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    triggers: HashMap<String, Arc<FakeTrigger>>,
    executables: HashMap<String, Arc<EchoCapability>>,
}

impl FakeRegistry {
    pub fn with_trigger(mut self, trigger: &Arc<FakeTrigger>) -> Self {
        self.triggers.insert(trigger.id.clone(), Arc::clone(trigger));
        self
    }

    pub fn with_executable(mut self, capability: &Arc<EchoCapability>) -> Self {
        self.executables.insert(capability.id.clone(), Arc::clone(capability));
        self
    }
}

#[async_trait]
impl CapabilitiesRegistry for FakeRegistry {
    async fn local_node(&self) -> Result<Node, PortsError> {
        Ok(local_node())
    }

    async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>, PortsError> {
        self.triggers
            .get(id)
            .map(|t| Arc::clone(t) as Arc<dyn TriggerCapability>)
            .ok_or_else(|| PortsError::not_found("trigger capability", id))
    }

    async fn get_executable(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>, PortsError> {
        self.executables
            .get(id)
            .map(|c| Arc::clone(c) as Arc<dyn ExecutableCapability>)
            .ok_or_else(|| PortsError::not_found("capability", id))
    }

    async fn config_for_capability(
        &self,
        capability_id: &str,
        _don_id: u32,
    ) -> Result<CapabilityConfiguration, PortsError> {
        Err(PortsError::not_found("capability config", capability_id))
    }

    async fn node_by_peer_id(&self, peer_id: &str) -> Result<Node, PortsError> {
        Err(PortsError::not_found("node", peer_id))
    }
}

/// Secrets fetcher serving `value-of-<id>` for every request.
pub struct StaticSecrets;

#[async_trait]
impl SecretsFetcher for StaticSecrets {
    async fn get_secrets(
        &self,
        _execution_id: &ExecutionId,
        request: GetSecretsRequest,
    ) -> Result<Vec<SecretResponse>, PortsError> {
        Ok(request
            .requests
            .iter()
            .map(|r| SecretResponse::value(&r.id, r.namespace_or_default(), OWNER, format!("value-of-{}", r.id)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

/// Node-wide workflow slots.
pub fn workflow_slots(per_owner: u64, global: u64) -> Arc<ScopedResourceLimiter> {
    Arc::new(ScopedResourceLimiter::new(
        "Global.WorkflowLimit",
        global,
        "PerOwner.WorkflowLimit",
        per_owner,
    ))
}

/// Node-wide execution rate.
pub fn execution_rate(per_owner: u32) -> Arc<ScopedRateLimiter> {
    Arc::new(
        ScopedRateLimiter::new(
            "Global.WorkflowExecutionRateLimit",
            Rate {
                per_second: 1_000,
                burst: 1_000,
            },
            "PerOwner.WorkflowExecutionRateLimit",
            Rate {
                per_second: per_owner,
                burst: per_owner,
            },
        )
        .unwrap(),
    )
}

pub fn limiters(configure: impl FnOnce(&mut PerWorkflowSettings)) -> EngineLimiters {
    EngineLimiters::new(&Factory::default(), &Tenant::default(), configure).unwrap()
}

/// A complete config for `workflow_id` of `owner`.
pub fn config_for(
    workflow_id: &str,
    owner: &str,
    module: Arc<TestModule>,
    registry: Arc<FakeRegistry>,
    hooks: Arc<RecordingHooks>,
    telemetry: Arc<InMemoryTelemetry>,
) -> EngineConfig {
    EngineConfig::new(workflow_id, owner, "price-feed")
        .with_module(module)
        .with_registry(registry)
        .with_local_time_provider()
        .with_secrets_fetcher(Arc::new(StaticSecrets))
        .with_limiters(limiters(|_| {}))
        .with_global_limiters(workflow_slots(10, 100), execution_rate(1_000))
        .with_hooks(hooks)
        .with_telemetry(telemetry)
}

/// A complete config for the default workflow.
pub fn config(
    module: Arc<TestModule>,
    registry: Arc<FakeRegistry>,
    hooks: Arc<RecordingHooks>,
    telemetry: Arc<InMemoryTelemetry>,
) -> EngineConfig {
    config_for(WORKFLOW_ID, OWNER, module, registry, hooks, telemetry)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
