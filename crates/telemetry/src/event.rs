//! Event bus for workflow lifecycle events.
//!
//! Uses [`tokio::sync::broadcast`] for fan-out delivery to multiple subscribers.
//! Events are fire-and-forget projections -- dropping them is acceptable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::labels::Labels;

/// Workflow lifecycle event.
///
/// Every variant carries the [`Labels`] of the workflow (and execution, when
/// there is one) that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution has started.
    ExecutionStarted {
        /// Workflow and execution tags.
        labels: Labels,
        /// Trigger capability that fired.
        trigger_id: String,
    },
    /// An execution has finished, successfully or not.
    ExecutionFinished {
        /// Workflow and execution tags.
        labels: Labels,
        /// `completed`, `errored`, or `timeout`.
        status: String,
        /// Wall-clock duration.
        duration: Duration,
    },
    /// A log line written by the workflow module.
    UserLog {
        /// Workflow and execution tags.
        labels: Labels,
        /// The (possibly truncated) line.
        message: String,
    },
    /// A finished metering report.
    MeteringReport {
        /// Workflow and execution tags.
        labels: Labels,
        /// Serialized report body.
        report: serde_json::Value,
    },
    /// A trigger event was discarded before execution.
    TriggerEventDropped {
        /// Workflow tags.
        labels: Labels,
        /// Why it was dropped.
        reason: String,
    },
    /// Periodic liveness signal of a running engine.
    Heartbeat {
        /// Workflow tags.
        labels: Labels,
    },
}

impl WorkflowEvent {
    /// Tags of the event.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        match self {
            Self::ExecutionStarted { labels, .. }
            | Self::ExecutionFinished { labels, .. }
            | Self::UserLog { labels, .. }
            | Self::MeteringReport { labels, .. }
            | Self::TriggerEventDropped { labels, .. }
            | Self::Heartbeat { labels } => labels,
        }
    }
}

/// Broadcast-based event bus.
///
/// Delivers events to all active subscribers. If no subscribers are
/// listening, events are silently dropped (fire-and-forget).
///
/// # Examples
///
/// ```
/// use donflow_telemetry::{EventBus, Labels, WorkflowEvent};
///
/// let bus = EventBus::new(64);
/// let mut sub = bus.subscribe();
///
/// bus.emit(WorkflowEvent::Heartbeat { labels: Labels::new() });
///
/// assert_eq!(bus.total_emitted(), 1);
/// assert!(sub.try_recv().is_some());
/// ```
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
    emitted: AtomicU64,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    ///
    /// When the channel is full, the oldest events are dropped (lagging
    /// subscribers skip ahead).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            emitted: AtomicU64::new(0),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: WorkflowEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Total number of events emitted since creation.
    #[must_use]
    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Subscription handle for receiving events from the [`EventBus`].
#[derive(Debug)]
pub struct EventSubscriber {
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl EventSubscriber {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` once the bus is dropped. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
