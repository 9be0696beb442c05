//! Forwarding of user log lines written by the module.

use std::sync::Arc;

use donflow_limits::BoundLimiter;
use donflow_telemetry::{Labels, TelemetryService, WorkflowEvent, metrics};
use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

/// Appended to lines cut at the line length bound.
pub const TRUNCATION_MARKER: &str = " ...(truncated)";

/// Non-blocking entry point for one execution's log lines.
#[derive(Clone)]
pub(crate) struct UserLogSink {
    tx: mpsc::Sender<String>,
    telemetry: Arc<dyn TelemetryService>,
}

impl UserLogSink {
    /// Queue `line`; a full channel drops it.
    pub(crate) fn emit(&self, line: String) {
        if let Err(e) = self.tx.try_send(line) {
            warn!(error = %e, "user log channel full, dropping line");
            self.telemetry.metrics().counter(metrics::USER_LOGS_DROPPED).inc();
        }
    }
}

/// Lines forwarded for one execution, bounded in count and length.
pub(crate) struct UserLogForwarder {
    rx: mpsc::Receiver<String>,
    log_event: BoundLimiter,
    log_line: BoundLimiter,
    labels: Labels,
    telemetry: Arc<dyn TelemetryService>,
}

impl UserLogForwarder {
    /// A sink and the forwarder draining it. The channel holds at most
    /// `log_event.limit()` lines.
    pub(crate) fn channel(
        log_event: BoundLimiter,
        log_line: BoundLimiter,
        labels: Labels,
        telemetry: Arc<dyn TelemetryService>,
    ) -> (UserLogSink, Self) {
        let capacity = usize::try_from(log_event.limit())
            .unwrap_or(usize::MAX)
            .clamp(1, Semaphore::MAX_PERMITS);
        let (tx, rx) = mpsc::channel(capacity);
        let sink = UserLogSink {
            tx,
            telemetry: Arc::clone(&telemetry),
        };
        (
            sink,
            Self {
                rx,
                log_event,
                log_line,
                labels,
                telemetry,
            },
        )
    }

    /// Forward lines until every sink is dropped.
    pub(crate) async fn run(mut self) {
        let mut forwarded: u64 = 0;
        let mut warned = false;
        while let Some(line) = self.rx.recv().await {
            if let Err(e) = self.log_event.check(forwarded + 1) {
                if !warned {
                    warn!(error = %e, "user log limit reached, dropping further lines");
                    warned = true;
                }
                self.telemetry.metrics().counter(metrics::USER_LOGS_DROPPED).inc();
                continue;
            }
            forwarded += 1;

            let message = self.bounded(line);
            info!(target: "donflow::user_log", "{message}");
            self.telemetry.event_bus().emit(WorkflowEvent::UserLog {
                labels: self.labels.clone(),
                message,
            });
        }
    }

    fn bounded(&self, line: String) -> String {
        if self.log_line.check(line.len() as u64).is_ok() {
            return line;
        }
        truncate(line, usize::try_from(self.log_line.limit()).unwrap_or(usize::MAX))
    }
}

/// Cut `line` to at most `max` bytes at a char boundary and mark it.
fn truncate(mut line: String, max: usize) -> String {
    let mut end = max.min(line.len());
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    line.truncate(end);
    line.push_str(TRUNCATION_MARKER);
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use donflow_core::Scope;
    use donflow_telemetry::{EventSubscriber, InMemoryTelemetry};
    use pretty_assertions::assert_eq;

    fn forwarder(
        count: u64,
        length: u64,
    ) -> (UserLogSink, UserLogForwarder, Arc<InMemoryTelemetry>) {
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let (sink, forwarder) = UserLogForwarder::channel(
            BoundLimiter::new("PerWorkflow.LogEventLimit", Scope::Workflow, "wf", count),
            BoundLimiter::new("PerWorkflow.LogLineLimit", Scope::Workflow, "wf", length),
            Labels::new().with("workflow_id", "wf"),
            telemetry.clone(),
        );
        (sink, forwarder, telemetry)
    }

    fn messages(subscriber: &mut EventSubscriber) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(event) = subscriber.try_recv() {
            if let WorkflowEvent::UserLog { message, .. } = event {
                out.push(message);
            }
        }
        out
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("abcdef".into(), 3), "abc ...(truncated)");
        assert_eq!(truncate("aé".into(), 2), "a ...(truncated)");
    }

    #[tokio::test]
    async fn lines_over_the_count_are_dropped() {
        let (sink, forwarder, telemetry) = forwarder(2, 100);
        let mut subscriber = telemetry.event_bus().subscribe();
        for line in ["one", "two", "three"] {
            sink.emit(line.to_owned());
        }
        drop(sink);
        forwarder.run().await;

        assert_eq!(messages(&mut subscriber), vec!["one", "two"]);
        assert_eq!(telemetry.metrics().counter(metrics::USER_LOGS_DROPPED).get(), 1);
    }

    #[tokio::test]
    async fn long_lines_are_truncated() {
        let (sink, forwarder, telemetry) = forwarder(10, 4);
        let mut subscriber = telemetry.event_bus().subscribe();
        sink.emit("short".to_owned());
        sink.emit("ok".to_owned());
        drop(sink);
        forwarder.run().await;

        assert_eq!(
            messages(&mut subscriber),
            vec!["shor ...(truncated)", "ok"]
        );
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (sink, _forwarder, telemetry) = forwarder(1, 100);
        sink.emit("first".to_owned());
        sink.emit("second".to_owned());
        assert_eq!(telemetry.metrics().counter(metrics::USER_LOGS_DROPPED).get(), 1);
    }
}
