//! Types shared between the orchestrator and the solvers.

use http::HeaderMap;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use super::classifier::ChallengeKind;
use crate::session::CookiePair;

/// Borrowed view of the response that classified as a challenge, plus the
/// resolution bookkeeping for this attempt. Owned by the orchestrator for the
/// duration of one solve cycle.
#[derive(Debug, Clone)]
pub struct ChallengeContext<'a> {
    pub kind: ChallengeKind,
    pub detected_at: Instant,
    pub url: &'a Url,
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub body: &'a str,
    /// 1-based count of the solver invocation this context feeds.
    pub solve_attempt: u32,
    /// The registry cancels the solver at this point.
    pub solve_deadline: Instant,
}

impl ChallengeContext<'_> {
    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.solve_deadline.saturating_duration_since(now)
    }
}

/// Solver output: the cookies and headers that unlock subsequent requests to
/// the domain, valid for `ttl` from issuance. Cached per domain by the
/// admission gate.
#[derive(Debug, Clone)]
pub struct ChallengeSolution {
    pub cookies: Vec<CookiePair>,
    pub headers: Vec<(String, String)>,
    pub issued_at: Instant,
    pub ttl: Duration,
}

impl ChallengeSolution {
    pub fn new(cookies: Vec<CookiePair>, ttl: Duration) -> Self {
        Self {
            cookies,
            headers: Vec::new(),
            issued_at: Instant::now(),
            ttl,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at()
    }
}
