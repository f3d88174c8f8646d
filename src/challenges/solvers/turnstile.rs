//! Turnstile widget solver.
//!
//! Extracts the site key from the interstitial, fetches a token from a
//! pluggable external provider, paces the submission like a human would, and
//! posts the form to collect clearance cookies.

use async_trait::async_trait;
use http::HeaderValue;
use http::header::{ORIGIN, REFERER};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::{ChallengeSolver, SolveError};
use crate::challenges::context::{ChallengeContext, ChallengeSolution};
use crate::session::cookies_from_headers;
use crate::transport::{Transport, TransportRequest};

const TOKEN_FIELD: &str = "cf-turnstile-response";
const DEFAULT_DELAY_MIN: Duration = Duration::from_secs(1);
const DEFAULT_DELAY_MAX: Duration = Duration::from_secs(5);
const DEFAULT_SOLUTION_TTL: Duration = Duration::from_secs(600);

static SITEKEY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"data-sitekey=['"]([0-9A-Za-z]{40})['"]"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid turnstile site key regex")
});

static FORM_ACTION_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"<form[^>]*action=['"]([^'"]+)['"]"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid turnstile form action regex")
});

static INPUT_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"<input[^>]*name=['"]([^'"]+)['"][^>]*value=['"]([^'"]*)['"]"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid input field regex")
});

/// What the provider needs to mint a token.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub site_key: String,
    pub page_url: Url,
    pub action: Option<String>,
}

/// A minted token plus how long the issuer vouches for it.
#[derive(Debug, Clone)]
pub struct TurnstileToken {
    pub token: String,
    pub expires_in: Option<Duration>,
}

impl TurnstileToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_in: None,
        }
    }

    pub fn with_expiry(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }
}

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("token provider failed: {0}")]
    Provider(String),
    #[error("token provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("token provider misconfigured: {0}")]
    Misconfigured(String),
}

/// External service that produces widget tokens. The crate ships no provider;
/// the solver is registered only when one is supplied.
#[async_trait]
pub trait TurnstileTokenProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn token(&self, request: &TokenRequest) -> Result<TurnstileToken, TokenProviderError>;
}

/// Solver for Turnstile interstitials.
pub struct TurnstileSolver {
    provider: Arc<dyn TurnstileTokenProvider>,
    delay_min: Duration,
    delay_max: Duration,
    solution_ttl: Duration,
}

impl TurnstileSolver {
    pub fn new(provider: Arc<dyn TurnstileTokenProvider>) -> Self {
        Self {
            provider,
            delay_min: DEFAULT_DELAY_MIN,
            delay_max: DEFAULT_DELAY_MAX,
            solution_ttl: DEFAULT_SOLUTION_TTL,
        }
    }

    /// Pacing range between receiving the token and posting the form.
    pub fn with_delay_range(mut self, min: Duration, max: Duration) -> Self {
        self.delay_min = min;
        self.delay_max = max.max(min);
        self
    }

    pub fn with_solution_ttl(mut self, ttl: Duration) -> Self {
        self.solution_ttl = ttl;
        self
    }

    fn pacing_delay(&self) -> Duration {
        if self.delay_max <= self.delay_min {
            return self.delay_min;
        }
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(
            rng.gen_range(self.delay_min.as_secs_f64()..self.delay_max.as_secs_f64()),
        )
    }
}

fn extract_site_key(body: &str) -> Option<String> {
    SITEKEY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Falls back to the challenged URL when the page carries no explicit form
/// action, matching how the widget reloads in place.
fn submit_url(body: &str, page_url: &Url) -> Result<Url, url::ParseError> {
    match FORM_ACTION_RE.captures(body).and_then(|caps| caps.get(1)) {
        Some(action) => {
            let action = html_escape::decode_html_entities(action.as_str());
            page_url.join(&action)
        }
        None => Ok(page_url.clone()),
    }
}

fn hidden_fields(body: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for caps in INPUT_FIELD_RE.captures_iter(body) {
        if let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) {
            let name = name.as_str();
            if name != TOKEN_FIELD && !fields.iter().any(|(existing, _)| existing == name) {
                fields.push((name.to_string(), value.as_str().to_string()));
            }
        }
    }
    fields
}

fn origin_value(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

#[async_trait]
impl ChallengeSolver for TurnstileSolver {
    fn name(&self) -> &'static str {
        "turnstile"
    }

    async fn solve(
        &self,
        ctx: &ChallengeContext<'_>,
        transport: &Arc<dyn Transport>,
    ) -> Result<ChallengeSolution, SolveError> {
        let site_key = extract_site_key(ctx.body)
            .ok_or_else(|| SolveError::failed(ctx.kind, "turnstile site key not found"))?;

        let token = self
            .provider
            .token(&TokenRequest {
                site_key,
                page_url: ctx.url.clone(),
                action: Some("turnstile".to_string()),
            })
            .await
            .map_err(|err| SolveError::failed(ctx.kind, err.to_string()))?;

        let target = submit_url(ctx.body, ctx.url)
            .map_err(|err| SolveError::failed(ctx.kind, format!("invalid form action: {err}")))?;

        let mut fields = hidden_fields(ctx.body);
        fields.push((TOKEN_FIELD.to_string(), token.token));

        // Instant submissions after token issuance get flagged.
        tokio::time::sleep(self.pacing_delay()).await;

        let mut request = TransportRequest::form(target, &fields).without_redirects();
        if let Ok(referer) = HeaderValue::from_str(ctx.url.as_str()) {
            request.headers.insert(REFERER, referer);
        }
        if let Ok(origin) = HeaderValue::from_str(&origin_value(ctx.url)) {
            request.headers.insert(ORIGIN, origin);
        }

        let response = transport
            .send(request)
            .await
            .map_err(|err| SolveError::failed(ctx.kind, format!("submission failed: {err}")))?;

        let cookies = cookies_from_headers(&response.headers);
        if cookies.is_empty() {
            return Err(SolveError::failed(
                ctx.kind,
                format!("no clearance cookies issued (status {})", response.status),
            ));
        }

        let ttl = match token.expires_in {
            Some(expiry) => self.solution_ttl.min(expiry),
            None => self.solution_ttl,
        };
        Ok(ChallengeSolution::new(cookies, ttl))
    }
}
