//! Trigger events through to finished executions.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use donflow_core::{ExecutionId, ManualClock, WorkflowId};
use donflow_engine::{Engine, EngineLimits, ExecutionStatus, TRUNCATION_MARKER};
use donflow_limits::HumanDuration;
use donflow_ports::ExecutionResult;
use donflow_telemetry::{InMemoryTelemetry, Labels, TelemetryService, WorkflowEvent, labels, metrics};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::json;
use tokio::sync::Semaphore;

fn execution_id(event_id: &str) -> ExecutionId {
    let workflow_id: WorkflowId = WORKFLOW_ID.parse().unwrap();
    ExecutionId::derive(&workflow_id, event_id)
}

fn finished_count(telemetry: &InMemoryTelemetry, status: ExecutionStatus) -> u64 {
    telemetry
        .metrics()
        .counter_with(metrics::EXECUTIONS_FINISHED, &Labels::new().with("status", status.as_str()))
        .get()
}

fn counter(telemetry: &InMemoryTelemetry, name: &str) -> u64 {
    telemetry.metrics().counter(name).get()
}

/// A started engine on one cron trigger, initialized.
struct Harness {
    engine: Engine,
    trigger: Arc<FakeTrigger>,
    module: Arc<TestModule>,
    telemetry: Arc<InMemoryTelemetry>,
    hooks: tokio::sync::mpsc::UnboundedReceiver<HookEvent>,
}

impl Harness {
    async fn start(behavior: Behavior) -> Self {
        Self::start_with(behavior, |config| config).await
    }

    async fn start_with(
        behavior: Behavior,
        adjust: impl FnOnce(donflow_engine::EngineConfig) -> donflow_engine::EngineConfig,
    ) -> Self {
        Self::start_on(behavior, FakeRegistry::default(), adjust).await
    }

    async fn start_on(
        behavior: Behavior,
        registry: FakeRegistry,
        adjust: impl FnOnce(donflow_engine::EngineConfig) -> donflow_engine::EngineConfig,
    ) -> Self {
        init_tracing();
        let trigger = FakeTrigger::new(CRON);
        let module = Arc::new(TestModule::new(&[CRON], behavior));
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let (hooks, mut rx) = RecordingHooks::new();
        let registry = Arc::new(registry.with_trigger(&trigger));
        let engine = Engine::new(adjust(config(
            Arc::clone(&module),
            registry,
            hooks,
            Arc::clone(&telemetry),
        )))
        .unwrap();
        engine.start().unwrap();
        assert_eq!(wait_initialized(&mut rx).await, Ok(()));
        Self {
            engine,
            trigger,
            module,
            telemetry,
            hooks: rx,
        }
    }

    fn completed_plus(&self, name: &str) -> u64 {
        finished_count(&self.telemetry, ExecutionStatus::Completed) + counter(&self.telemetry, name)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_execution_reports_result_then_finish() {
    let mut h = Harness::start(Behavior::Echo).await;
    let mut events = h.telemetry.event_bus().subscribe();

    h.trigger.fire("e1", json!({ "msg": "hi" })).await;

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Result(ExecutionResult::Value(json!("hi")))
    );
    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Finished(execution_id("e1"), ExecutionStatus::Completed)
    );
    assert_eq!(finished_count(&h.telemetry, ExecutionStatus::Completed), 1);
    assert_eq!(counter(&h.telemetry, metrics::TRIGGER_EVENTS_RECEIVED), 1);

    let mut started = None;
    while let Some(event) = events.try_recv() {
        if let WorkflowEvent::ExecutionStarted { labels, trigger_id } = event {
            started = Some((labels, trigger_id));
        }
    }
    let (tags, trigger_id) = started.expect("no ExecutionStarted event");
    assert_eq!(trigger_id, CRON);
    assert_eq!(tags.get(labels::WORKFLOW_ID), Some(WORKFLOW_ID));
    assert_eq!(tags.get(labels::EXECUTION_ID), Some(execution_id("e1").as_str()));
    assert_eq!(tags.get(labels::TRIGGER_ID), Some(CRON));

    h.engine.close().await.unwrap();
    assert_eq!(
        h.telemetry.metrics().gauge(metrics::EXECUTIONS_IN_FLIGHT).get(),
        0
    );
}

#[tokio::test]
async fn module_failure_is_reported_as_errored() {
    let mut h = Harness::start(Behavior::Fail).await;

    h.trigger.fire("e1", json!({})).await;

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Finished(execution_id("e1"), ExecutionStatus::Errored)
    );
    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Error("module error: wasm trap: unreachable".to_owned())
    );
    h.engine.close().await.unwrap();
}

#[tokio::test]
async fn in_band_error_is_reported_as_errored() {
    let mut h = Harness::start(Behavior::InBandError).await;

    h.trigger.fire("e1", json!({})).await;

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Finished(execution_id("e1"), ExecutionStatus::Errored)
    );
    assert_eq!(next_hook(&mut h.hooks).await, HookEvent::Error("bad input".to_owned()));
    assert_eq!(finished_count(&h.telemetry, ExecutionStatus::Errored), 1);
    h.engine.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_execution_times_out() {
    let mut h = Harness::start_with(Behavior::Sleep(Duration::from_secs(10)), |config| {
        config.with_limiters(limiters(|s| {
            s.execution_timeout.default = HumanDuration(Duration::from_secs(1));
        }))
    })
    .await;

    h.trigger.fire("e1", json!({})).await;

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Finished(execution_id("e1"), ExecutionStatus::Timeout)
    );
    let HookEvent::Error(message) = next_hook(&mut h.hooks).await else {
        panic!("expected an execution error");
    };
    assert!(message.contains("PerWorkflow.ExecutionTimeout exceeded"), "{message}");
    h.engine.close().await.unwrap();
}

#[tokio::test]
async fn trigger_errors_are_counted_not_executed() {
    let mut h = Harness::start(Behavior::Echo).await;

    h.trigger.fail("upstream unavailable").await;
    h.trigger.fire("e1", json!({ "msg": "after" })).await;

    assert_eq!(
        wait_for(&mut h.hooks, |e| matches!(e, HookEvent::Finished(..))).await,
        HookEvent::Finished(execution_id("e1"), ExecutionStatus::Completed)
    );
    assert_eq!(counter(&h.telemetry, metrics::TRIGGER_EVENT_ERRORS), 1);
    assert_eq!(counter(&h.telemetry, metrics::TRIGGER_EVENTS_RECEIVED), 1);
    h.engine.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[rstest]
#[case(1)]
#[case(2)]
#[tokio::test]
async fn concurrency_limit_caps_running_executions(#[case] limit: u64) {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = Harness::start_with(Behavior::Gate(Arc::clone(&gate)), |config| {
        config.with_limiters(limiters(|s| s.execution_concurrency_limit.default = limit))
    })
    .await;

    for i in 0..4 {
        h.trigger.fire(&format!("e{i}"), json!({})).await;
    }
    let expected = usize::try_from(limit).unwrap();
    eventually(|| h.module.max_running.load(Ordering::SeqCst) == expected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.module.max_running.load(Ordering::SeqCst), expected);

    gate.add_permits(100);
    let done = finished(&mut h.hooks, 4).await;
    assert!(done.iter().all(|(_, status)| *status == ExecutionStatus::Completed));
    assert_eq!(h.module.max_running.load(Ordering::SeqCst), expected);
    h.engine.close().await.unwrap();
}

#[tokio::test]
async fn stale_events_are_discarded() {
    let clock = Arc::new(ManualClock::default());
    let gate = Arc::new(Semaphore::new(0));
    let engine_clock = Arc::clone(&clock);
    let h = Harness::start_with(Behavior::Gate(Arc::clone(&gate)), move |config| {
        config
            .with_clock(engine_clock)
            .with_limiters(limiters(|s| s.execution_concurrency_limit.default = 1))
    })
    .await;
    let mut events = h.telemetry.event_bus().subscribe();

    h.trigger.fire("e1", json!({})).await;
    eventually(|| h.module.max_running.load(Ordering::SeqCst) == 1).await;
    h.trigger.fire("e2", json!({})).await;
    h.trigger.fire("e3", json!({})).await;
    eventually(|| counter(&h.telemetry, metrics::TRIGGER_EVENTS_RECEIVED) == 3).await;

    clock.advance(Duration::from_secs(60 * 60));
    gate.add_permits(100);

    eventually(|| h.completed_plus(metrics::TRIGGER_EVENTS_STALE) == 3).await;
    let stale = counter(&h.telemetry, metrics::TRIGGER_EVENTS_STALE);
    assert!(stale >= 1, "no event was discarded");

    let dropped = std::iter::from_fn(|| events.try_recv())
        .filter(|e| matches!(e, WorkflowEvent::TriggerEventDropped { .. }))
        .count();
    assert_eq!(dropped as u64, stale);
    h.engine.close().await.unwrap();
}

#[rstest]
#[case::just_inside(Duration::from_millis(9_999), true)]
#[case::at_max_age(Duration::from_secs(10), true)]
#[case::just_past(Duration::from_millis(10_001), false)]
#[tokio::test]
async fn queued_event_age_is_checked_against_max_age(#[case] waited: Duration, #[case] executes: bool) {
    let clock = Arc::new(ManualClock::default());
    let gate = Arc::new(Semaphore::new(0));
    let engine_limiters = limiters(|s| {
        s.execution_concurrency_limit.default = 1;
        s.trigger_event_queue_timeout.default = HumanDuration(Duration::from_secs(10));
    });
    let queue = Arc::clone(&engine_limiters.trigger_event_queue);
    let engine_clock = Arc::clone(&clock);
    let mut h = Harness::start_with(Behavior::Gate(Arc::clone(&gate)), move |config| {
        config.with_clock(engine_clock).with_limiters(engine_limiters)
    })
    .await;

    // e1 runs and holds the only slot; e2 is taken off the queue while still
    // fresh and waits for the slot; e3 stays queued.
    h.trigger.fire("e1", json!({})).await;
    eventually(|| h.module.max_running.load(Ordering::SeqCst) == 1).await;
    h.trigger.fire("e2", json!({})).await;
    eventually(|| counter(&h.telemetry, metrics::TRIGGER_EVENTS_RECEIVED) == 2 && queue.is_empty()).await;
    h.trigger.fire("e3", json!({})).await;
    eventually(|| counter(&h.telemetry, metrics::TRIGGER_EVENTS_RECEIVED) == 3 && queue.len() == 1).await;

    clock.advance(waited);
    gate.add_permits(100);

    eventually(|| h.completed_plus(metrics::TRIGGER_EVENTS_STALE) == 3).await;
    h.engine.close().await.unwrap();

    let stale = counter(&h.telemetry, metrics::TRIGGER_EVENTS_STALE);
    let mut finished_ids = Vec::new();
    while let Ok(event) = h.hooks.try_recv() {
        if let HookEvent::Finished(id, status) = event {
            assert_eq!(status, ExecutionStatus::Completed);
            finished_ids.push(id);
        }
    }
    if executes {
        assert_eq!(stale, 0);
        assert_eq!(finished_ids, vec![execution_id("e1"), execution_id("e2"), execution_id("e3")]);
    } else {
        assert_eq!(stale, 1);
        assert_eq!(finished_ids, vec![execution_id("e1"), execution_id("e2")]);
    }
}

#[tokio::test]
async fn full_queue_drops_events() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::start_with(Behavior::Gate(Arc::clone(&gate)), |config| {
        config.with_limiters(limiters(|s| {
            s.trigger_event_queue_limit.default = 1;
            s.execution_concurrency_limit.default = 1;
        }))
    })
    .await;

    h.trigger.fire("e0", json!({})).await;
    eventually(|| h.module.max_running.load(Ordering::SeqCst) == 1).await;
    for i in 1..5 {
        h.trigger.fire(&format!("e{i}"), json!({})).await;
    }
    eventually(|| counter(&h.telemetry, metrics::TRIGGER_EVENTS_RECEIVED) == 5).await;
    let full = counter(&h.telemetry, metrics::TRIGGER_EVENT_QUEUE_FULL);
    assert!(full >= 2, "only {full} events dropped");

    gate.add_permits(100);
    eventually(|| h.completed_plus(metrics::TRIGGER_EVENT_QUEUE_FULL) == 5).await;
    h.engine.close().await.unwrap();
}

#[tokio::test]
async fn owner_rate_limit_skips_executions() {
    let mut h = Harness::start_with(Behavior::Echo, |config| {
        config.with_global_limiters(workflow_slots(10, 100), execution_rate(1))
    })
    .await;

    h.trigger.fire("e1", json!({ "msg": "first" })).await;
    h.trigger.fire("e2", json!({ "msg": "second" })).await;

    assert_eq!(
        wait_for(&mut h.hooks, |e| matches!(e, HookEvent::RateLimited(_))).await,
        HookEvent::RateLimited(execution_id("e2"))
    );
    h.engine.close().await.unwrap();
    assert_eq!(finished_count(&h.telemetry, ExecutionStatus::Completed), 1);
}

// ---------------------------------------------------------------------------
// Execution helper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_logs_are_truncated_and_capped() {
    let lines = vec![
        "short".to_owned(),
        "this line is too long".to_owned(),
        "one too many".to_owned(),
    ];
    let mut h = Harness::start_with(Behavior::Log(lines), |config| {
        config.with_limiters(limiters(|s| {
            s.log_line_limit.default = 8;
            s.log_event_limit.default = 2;
        }))
    })
    .await;
    let mut events = h.telemetry.event_bus().subscribe();

    h.trigger.fire("e1", json!({})).await;
    wait_for(&mut h.hooks, |e| matches!(e, HookEvent::Finished(..))).await;
    eventually(|| counter(&h.telemetry, metrics::USER_LOGS_DROPPED) == 1).await;

    let messages: Vec<String> = std::iter::from_fn(|| events.try_recv())
        .filter_map(|e| match e {
            WorkflowEvent::UserLog { labels: tags, message } => {
                assert_eq!(tags.get(labels::EXECUTION_ID), Some(execution_id("e1").as_str()));
                Some(message)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        messages,
        vec!["short".to_owned(), format!("this lin{TRUNCATION_MARKER}")]
    );
    h.engine.close().await.unwrap();
}

#[tokio::test]
async fn capability_calls_carry_execution_metadata() {
    let http = EchoCapability::new("http-actions@1.0.0");
    let registry = FakeRegistry::default().with_executable(&http);
    let behavior = Behavior::Call {
        capability_id: "http-actions@1.0.0".to_owned(),
        times: 1,
    };
    let mut h = Harness::start_on(behavior, registry, |config| config).await;

    h.trigger.fire("e1", json!({ "url": "https://example.com" })).await;

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Result(ExecutionResult::Value(json!({ "url": "https://example.com" })))
    );
    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    h.engine.close().await.unwrap();
}

#[tokio::test]
async fn capability_call_budget_fails_the_execution() {
    let http = EchoCapability::new("http-actions@1.0.0");
    let registry = FakeRegistry::default().with_executable(&http);
    let behavior = Behavior::Call {
        capability_id: "http-actions@1.0.0".to_owned(),
        times: 2,
    };
    let mut h = Harness::start_on(behavior, registry, |config| {
        config.with_limiters(limiters(|s| s.http_action_call_limit.default = 1))
    })
    .await;

    h.trigger.fire("e1", json!({})).await;

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Finished(execution_id("e1"), ExecutionStatus::Errored)
    );
    let HookEvent::Error(message) = next_hook(&mut h.hooks).await else {
        panic!("expected an execution error");
    };
    assert!(message.contains("PerWorkflow.HTTPActionCallLimit"), "{message}");
    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    h.engine.close().await.unwrap();
}

#[tokio::test]
async fn secrets_are_served_to_executions() {
    let mut h = Harness::start(Behavior::Secret("API_KEY".to_owned())).await;

    h.trigger.fire("e1", json!({})).await;

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Result(ExecutionResult::Value(json!("value-of-API_KEY")))
    );
    h.engine.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn close_cancels_executions_after_shutdown_timeout() {
    let mut h = Harness::start_with(Behavior::Sleep(Duration::from_secs(60)), |config| {
        config.with_limits(EngineLimits {
            shutdown_timeout: Duration::from_secs(1),
            ..EngineLimits::default()
        })
    })
    .await;

    h.trigger.fire("e1", json!({})).await;
    eventually(|| h.module.max_running.load(Ordering::SeqCst) == 1).await;

    let started = tokio::time::Instant::now();
    h.engine.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(60));

    assert_eq!(
        next_hook(&mut h.hooks).await,
        HookEvent::Finished(execution_id("e1"), ExecutionStatus::Errored)
    );
    assert_eq!(next_hook(&mut h.hooks).await, HookEvent::Error("cancelled".to_owned()));
    assert_eq!(h.trigger.unregistered().len(), 1);
}
