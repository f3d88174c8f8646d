//! Single-attempt request execution.
//!
//! Assembles one wire request from the task, the browser identity, the
//! session jar, and any cached challenge solution, then runs it through the
//! transport under the per-attempt timeout. Classification of the result is
//! the orchestrator's job; this layer only measures and persists cookies.

use http::header::COOKIE;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::challenges::context::ChallengeSolution;
use crate::identity::FingerprintProvider;
use crate::session::{CookiePair, SessionStore, cookie_header_value, cookies_from_headers, parse_cookie_header};
use crate::task::RequestTask;

use super::{Transport, TransportError, TransportRequest, TransportResponse};

/// Wire timing splits plus the wall-clock total for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptTiming {
    pub total: Duration,
    pub connect: Option<Duration>,
    pub tls_handshake: Option<Duration>,
}

/// One completed network attempt.
#[derive(Debug)]
pub struct AttemptReport {
    pub response: TransportResponse,
    pub timing: AttemptTiming,
}

pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn FingerprintProvider>,
    sessions: Arc<dyn SessionStore>,
    request_timeout: Duration,
    overridable: HashSet<String>,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Arc<dyn FingerprintProvider>,
        sessions: Arc<dyn SessionStore>,
        request_timeout: Duration,
        overridable_headers: &[String],
    ) -> Self {
        Self {
            transport,
            identity,
            sessions,
            request_timeout,
            overridable: overridable_headers
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Runs one attempt. The effective timeout is the per-attempt limit or
    /// the remaining task deadline, whichever is tighter.
    pub async fn execute(
        &self,
        task: &RequestTask,
        solution: Option<&ChallengeSolution>,
        deadline: Option<Instant>,
    ) -> Result<AttemptReport, TransportError> {
        let headers = self.assemble_headers(task, solution).await;

        let request = TransportRequest {
            method: task.method.clone(),
            url: task.url.clone(),
            headers,
            body: task.body.clone(),
            tls: self.identity.tls_identity(),
            follow_redirects: true,
        };

        let started = Instant::now();
        let budget = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(started)
                .min(self.request_timeout),
            None => self.request_timeout,
        };
        if budget.is_zero() {
            return Err(TransportError::Timeout(Duration::ZERO));
        }

        let response = match tokio::time::timeout(budget, self.transport.send(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(budget)),
        };
        let total = Instant::now() - started;

        let issued = cookies_from_headers(&response.headers);
        if !issued.is_empty() {
            self.sessions.save(&task.domain, issued).await;
        }

        Ok(AttemptReport {
            timing: AttemptTiming {
                total,
                connect: response.timing.connect,
                tls_handshake: response.timing.tls_handshake,
            },
            response,
        })
    }

    /// Identity headers go in first. Caller headers win a case-insensitive
    /// collision only when the name is on the overridable list; everything
    /// non-colliding passes through. The cookie jar is assembled last so
    /// clearance cookies from a solution replace stale session ones.
    async fn assemble_headers(
        &self,
        task: &RequestTask,
        solution: Option<&ChallengeSolution>,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in self.identity.headers_for(&task.url) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }

        let mut caller_cookie: Option<String> = None;
        for (name, value) in &task.headers {
            if *name == COOKIE {
                caller_cookie = value.to_str().ok().map(str::to_string);
                continue;
            }
            if headers.contains_key(name) && !self.overridable.contains(name.as_str()) {
                log::debug!(
                    "{}: dropping caller header {} shadowed by the browser identity",
                    task.id,
                    name
                );
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        let mut jar: Vec<CookiePair> = Vec::new();
        if self.overridable.contains("cookie")
            && let Some(raw) = caller_cookie.as_deref()
        {
            jar.extend(parse_cookie_header(raw));
        }
        if let Some(stored) = self.sessions.load(&task.domain).await {
            jar.extend(stored);
        }
        if let Some(solution) = solution {
            jar.extend(solution.cookies.iter().cloned());
        }
        if let Some(rendered) = cookie_header_value(&jar)
            && let Ok(value) = HeaderValue::from_str(&rendered)
        {
            headers.insert(COOKIE, value);
        }

        if let Some(solution) = solution {
            for (name, value) in &solution.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }

        headers
    }
}
