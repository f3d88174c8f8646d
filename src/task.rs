//! Task types: the unit of work callers submit and the terminal outcome
//! they get back.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::challenges::classifier::ChallengeKind;
use crate::transport::{TransportError, TransportResponse};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique task identifier, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Admission priority. Within one domain, waiting `High` tasks are admitted
/// before `Normal` before `Low`; within a class admission is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub(crate) fn queue_index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// One unit of work. Built by the caller, consumed by `Orchestrator::submit`;
/// attempt bookkeeping stays inside the orchestrator.
#[derive(Debug, Clone)]
pub struct RequestTask {
    pub id: TaskId,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Lowercased host the admission controller schedules on.
    pub domain: String,
    pub priority: Priority,
    /// Absolute deadline; the clock runs from submission, not admission.
    pub deadline: Option<Instant>,
    pub max_transport_attempts: Option<u32>,
    pub max_solve_attempts: Option<u32>,
}

impl RequestTask {
    pub fn new(method: Method, url: impl AsRef<str>) -> Result<Self, TaskBuildError> {
        let url = Url::parse(url.as_ref())?;
        let domain = url
            .host_str()
            .ok_or(TaskBuildError::MissingHost)?
            .to_ascii_lowercase();
        Ok(Self {
            id: TaskId::next(),
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            domain,
            priority: Priority::Normal,
            deadline: None,
            max_transport_attempts: None,
            max_solve_attempts: None,
        })
    }

    pub fn get(url: impl AsRef<str>) -> Result<Self, TaskBuildError> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl AsRef<str>, body: impl Into<Bytes>) -> Result<Self, TaskBuildError> {
        let mut task = Self::new(Method::POST, url)?;
        task.body = Some(body.into());
        Ok(task)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Overrides the configured transport-failure budget for this task.
    pub fn with_transport_attempts(mut self, attempts: u32) -> Self {
        self.max_transport_attempts = Some(attempts);
        self
    }

    /// Overrides the configured solve-attempt budget for this task.
    pub fn with_solve_attempts(mut self, attempts: u32) -> Self {
        self.max_solve_attempts = Some(attempts);
        self
    }

    pub fn deadline_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug, Error)]
pub enum TaskBuildError {
    #[error("invalid task url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("task url has no host to schedule on")]
    MissingHost,
}

/// Final response surfaced to the caller on success.
#[derive(Debug, Clone)]
pub struct TaskResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
}

impl TaskResponse {
    pub(crate) fn from_transport(response: TransportResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            url: response.url,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Terminal outcome. Every submitted task produces exactly one.
#[derive(Debug)]
pub enum TaskOutcome {
    Success(TaskResponse),
    /// Solver budget exhausted, solve timed out repeatedly, or the kind has
    /// no registered solver. `attempts` counts solver invocations that ran.
    ChallengeUnsolved { kind: ChallengeKind, attempts: u32 },
    /// The target signalled 429. Resubmit after `backoff_until`.
    RateLimited { backoff_until: Instant },
    /// No admission slot under the configured backpressure policy.
    AdmissionRejected,
    /// Transport-failure budget exhausted; carries the last wire error.
    TransportFailed { error: TransportError, attempts: u32 },
    /// The absolute deadline passed; always terminal, never retried.
    DeadlineExceeded,
}

impl TaskOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            TaskOutcome::Success(_) => OutcomeKind::Success,
            TaskOutcome::ChallengeUnsolved { .. } => OutcomeKind::ChallengeUnsolved,
            TaskOutcome::RateLimited { .. } => OutcomeKind::RateLimited,
            TaskOutcome::AdmissionRejected => OutcomeKind::AdmissionRejected,
            TaskOutcome::TransportFailed { .. } => OutcomeKind::TransportFailed,
            TaskOutcome::DeadlineExceeded => OutcomeKind::DeadlineExceeded,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    pub fn into_response(self) -> Option<TaskResponse> {
        match self {
            TaskOutcome::Success(response) => Some(response),
            _ => None,
        }
    }
}

/// Coarse outcome label used by metrics and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    ChallengeUnsolved,
    RateLimited,
    AdmissionRejected,
    TransportFailed,
    DeadlineExceeded,
}

impl OutcomeKind {
    pub fn label(self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::ChallengeUnsolved => "challenge_unsolved",
            OutcomeKind::RateLimited => "rate_limited",
            OutcomeKind::AdmissionRejected => "admission_rejected",
            OutcomeKind::TransportFailed => "transport_failed",
            OutcomeKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_task_with_derived_domain() {
        let task = RequestTask::get("https://EXAMPLE.com/path?q=1").unwrap();
        assert_eq!(task.domain, "example.com");
        assert_eq!(task.method, Method::GET);
        assert_eq!(task.priority, Priority::Normal);
        assert!(task.deadline.is_none());
    }

    #[test]
    fn rejects_hostless_urls() {
        assert!(matches!(
            RequestTask::get("mailto:someone@example.com"),
            Err(TaskBuildError::MissingHost)
        ));
        assert!(matches!(
            RequestTask::get("not a url"),
            Err(TaskBuildError::InvalidUrl(_))
        ));
    }

    #[test]
    fn ids_are_unique() {
        let a = RequestTask::get("https://a.test/").unwrap();
        let b = RequestTask::get("https://a.test/").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn builder_chain_applies_every_field() {
        let task = RequestTask::post("https://example.com/submit", "payload")
            .unwrap()
            .with_priority(Priority::High)
            .with_header(
                http::header::ACCEPT_LANGUAGE,
                HeaderValue::from_static("de-DE"),
            )
            .with_transport_attempts(1)
            .with_solve_attempts(2);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.body.as_deref(), Some(b"payload".as_slice()));
        assert_eq!(task.max_transport_attempts, Some(1));
        assert_eq!(task.max_solve_attempts, Some(2));
        assert_eq!(
            task.headers.get(http::header::ACCEPT_LANGUAGE).unwrap(),
            "de-DE"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_tracks_virtual_time() {
        let task =
            RequestTask::get("https://example.com/").unwrap().with_timeout(Duration::from_secs(5));
        assert!(!task.deadline_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(task.deadline_expired(Instant::now()));
    }

    #[test]
    fn outcome_kinds_map_one_to_one() {
        assert_eq!(TaskOutcome::AdmissionRejected.kind(), OutcomeKind::AdmissionRejected);
        assert_eq!(TaskOutcome::DeadlineExceeded.kind(), OutcomeKind::DeadlineExceeded);
        assert_eq!(
            TaskOutcome::ChallengeUnsolved { kind: ChallengeKind::Managed, attempts: 0 }.kind(),
            OutcomeKind::ChallengeUnsolved
        );
        assert_eq!(OutcomeKind::RateLimited.label(), "rate_limited");
    }
}
