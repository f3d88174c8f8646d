//! Lifecycle event stream.
//!
//! The orchestrator emits one event per state transition; handlers observe
//! them synchronously. The built-in handlers cover structured logging and
//! forwarding completion data into a metrics sink.

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::time::Instant;
use url::Url;

use crate::challenges::classifier::ChallengeKind;
use crate::metrics::MetricsSink;
use crate::task::{OutcomeKind, TaskId};

/// Emitted after admission, immediately before the wire attempt.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub task_id: TaskId,
    pub domain: String,
    pub method: Method,
    pub url: Url,
    /// 1-based transport attempt number.
    pub attempt: u32,
}

/// Emitted for every response that came back, challenge pages included.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub task_id: TaskId,
    pub domain: String,
    pub status: u16,
    pub elapsed: Duration,
}

/// Emitted after each solver invocation, successful or not.
#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub task_id: TaskId,
    pub domain: String,
    pub kind: ChallengeKind,
    pub solved: bool,
    pub elapsed: Duration,
    /// 1-based solver invocation number.
    pub attempt: u32,
}

/// Emitted when a domain enters backoff.
#[derive(Debug, Clone)]
pub struct BackoffEvent {
    pub domain: String,
    pub consecutive_failures: u32,
    pub backoff_until: Instant,
    pub effective_rate: f64,
}

/// Emitted before a transport retry sleeps.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub task_id: TaskId,
    pub domain: String,
    pub attempt: u32,
    pub pause: Duration,
}

/// Emitted exactly once per submitted task.
#[derive(Debug, Clone)]
pub struct TaskCompletedEvent {
    pub task_id: TaskId,
    pub domain: String,
    pub outcome: OutcomeKind,
    /// Submission to completion, queueing included.
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    PreRequest(PreRequestEvent),
    Response(ResponseEvent),
    Challenge(ChallengeEvent),
    Backoff(BackoffEvent),
    Retry(RetryEvent),
    TaskCompleted(TaskCompletedEvent),
}

/// Synchronous observer. Handlers run inline on the submit path and must not
/// block.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &OrchestratorEvent);
}

/// Fans one event out to every registered handler, in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Logs every event through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::PreRequest(e) => {
                log::debug!(
                    "{} {} {} attempt {} ({})",
                    e.task_id,
                    e.method,
                    e.url,
                    e.attempt,
                    e.domain
                );
            }
            OrchestratorEvent::Response(e) => {
                log::debug!(
                    "{} {} responded {} in {:?}",
                    e.task_id,
                    e.domain,
                    e.status,
                    e.elapsed
                );
            }
            OrchestratorEvent::Challenge(e) => {
                if e.solved {
                    log::info!(
                        "{} solved {} challenge on {} in {:?} (attempt {})",
                        e.task_id,
                        e.kind,
                        e.domain,
                        e.elapsed,
                        e.attempt
                    );
                } else {
                    log::warn!(
                        "{} failed {} challenge on {} after {:?} (attempt {})",
                        e.task_id,
                        e.kind,
                        e.domain,
                        e.elapsed,
                        e.attempt
                    );
                }
            }
            OrchestratorEvent::Backoff(e) => {
                log::warn!(
                    "{} backing off ({} consecutive failures, rate {:.2}/s)",
                    e.domain,
                    e.consecutive_failures,
                    e.effective_rate
                );
            }
            OrchestratorEvent::Retry(e) => {
                log::debug!(
                    "{} retrying {} in {:?} (attempt {})",
                    e.task_id,
                    e.domain,
                    e.pause,
                    e.attempt
                );
            }
            OrchestratorEvent::TaskCompleted(e) => {
                log::info!(
                    "{} completed on {}: {} in {:?}",
                    e.task_id,
                    e.domain,
                    e.outcome,
                    e.elapsed
                );
            }
        }
    }
}

/// Bridges the event stream into a [`MetricsSink`].
pub struct SinkHandler {
    sink: Arc<dyn MetricsSink>,
}

impl SinkHandler {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl EventHandler for SinkHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::TaskCompleted(e) => {
                self.sink.record_timing(&e.domain, e.outcome, e.elapsed);
            }
            OrchestratorEvent::Challenge(e) => {
                self.sink.record_challenge(e.kind, e.solved, e.elapsed);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: &OrchestratorEvent) {
            let label = match event {
                OrchestratorEvent::PreRequest(_) => "pre_request",
                OrchestratorEvent::Response(_) => "response",
                OrchestratorEvent::Challenge(_) => "challenge",
                OrchestratorEvent::Backoff(_) => "backoff",
                OrchestratorEvent::Retry(_) => "retry",
                OrchestratorEvent::TaskCompleted(_) => "task_completed",
            };
            self.seen.lock().unwrap().push(label);
        }
    }

    fn completed(domain: &str, outcome: OutcomeKind) -> OrchestratorEvent {
        OrchestratorEvent::TaskCompleted(TaskCompletedEvent {
            task_id: TaskId(1),
            domain: domain.to_string(),
            outcome,
            elapsed: Duration::from_millis(250),
        })
    }

    #[test]
    fn dispatcher_fans_out_in_order() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(recorder.clone());
        dispatcher.register(Arc::new(LoggingHandler));

        dispatcher.emit(completed("a.test", OutcomeKind::Success));
        dispatcher.emit(OrchestratorEvent::Retry(RetryEvent {
            task_id: TaskId(1),
            domain: "a.test".into(),
            attempt: 2,
            pause: Duration::from_millis(500),
        }));

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["task_completed", "retry"]);
    }

    #[test]
    fn sink_handler_forwards_completions_and_challenges() {
        let collector = Arc::new(MetricsCollector::new(16));
        let handler = SinkHandler::new(collector.clone());

        handler.handle(&completed("a.test", OutcomeKind::Success));
        handler.handle(&OrchestratorEvent::Challenge(ChallengeEvent {
            task_id: TaskId(1),
            domain: "a.test".into(),
            kind: ChallengeKind::Javascript,
            solved: true,
            elapsed: Duration::from_secs(3),
            attempt: 1,
        }));
        // Non-terminal events are ignored by the sink bridge.
        handler.handle(&OrchestratorEvent::Response(ResponseEvent {
            task_id: TaskId(1),
            domain: "a.test".into(),
            status: 200,
            elapsed: Duration::from_millis(100),
        }));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.challenges.len(), 1);
        assert_eq!(snapshot.challenges[0].solved, 1);
    }
}
