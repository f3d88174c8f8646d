//! Script-challenge solver.
//!
//! Parses the interstitial form, computes the answer through a pluggable
//! script engine, waits the delay the page mandates, and submits the form to
//! collect the clearance cookies that make up the solution.

use async_trait::async_trait;
use http::HeaderValue;
use http::header::{ORIGIN, REFERER};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::{ChallengeSolver, SolveError};
use crate::challenges::context::{ChallengeContext, ChallengeSolution};
use crate::session::cookies_from_headers;
use crate::transport::{Transport, TransportRequest};

/// Computes the answer a script interstitial demands. Implementations wrap a
/// JavaScript engine; the crate ships none and registers this solver only
/// when an engine is supplied.
pub trait ScriptEngine: Send + Sync {
    fn evaluate_challenge(&self, page_html: &str, host: &str) -> Result<String, ScriptError>;
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script evaluation failed: {0}")]
    Evaluation(String),
    #[error("challenge script is malformed: {0}")]
    MalformedScript(String),
}

const ANSWER_FIELD: &str = "jschl_answer";
const DEFAULT_SOLUTION_TTL: Duration = Duration::from_secs(600);
/// Interstitial delays beyond this are a parsing artifact, not a real wait.
const MAX_PAGE_DELAY: Duration = Duration::from_secs(10);

static FORM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"(?si)<form[^>]*id=['"]challenge-form['"][^>]*action=['"](?P<action>[^"']+)['"][^>]*>(?P<inputs>.*?)</form>"#,
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .expect("invalid challenge form regex")
});

static INPUT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?si)<input\s+([^>]+?)/?>"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid input regex")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?si)(?P<name>[^\s=]+)=['"](?P<value>[^'"]*)['"]"#)
        .case_insensitive(true)
        .build()
        .expect("invalid attribute regex")
});

static DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"submit\(\);\r?\n\s*},\s*([0-9]+)"#)
        .case_insensitive(true)
        .build()
        .expect("invalid delay regex")
});

/// Snapshot of the interstitial form: where to submit and what to echo back.
#[derive(Debug, Clone, PartialEq)]
struct ChallengeForm {
    action: String,
    hidden_fields: Vec<(String, String)>,
}

fn parse_challenge_form(body: &str) -> Option<ChallengeForm> {
    let captures = FORM_RE.captures(body)?;
    let action = html_escape::decode_html_entities(captures.name("action")?.as_str()).to_string();
    let inputs = captures.name("inputs").map(|m| m.as_str()).unwrap_or("");

    let mut hidden_fields = Vec::new();
    for caps in INPUT_RE.captures_iter(inputs) {
        let attributes = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let mut field_name: Option<String> = None;
        let mut field_value: Option<String> = None;
        for attr in ATTR_RE.captures_iter(attributes) {
            if let (Some(name), Some(value)) = (attr.name("name"), attr.name("value")) {
                match name.as_str().to_ascii_lowercase().as_str() {
                    "name" => field_name = Some(value.as_str().to_string()),
                    "value" => field_value = Some(value.as_str().to_string()),
                    _ => {}
                }
            }
        }
        if let (Some(name), Some(value)) = (field_name, field_value) {
            hidden_fields.push((name, value));
        }
    }

    Some(ChallengeForm {
        action,
        hidden_fields,
    })
}

/// Extracts the `setTimeout` delay before the page allows submission.
fn extract_page_delay(body: &str) -> Option<Duration> {
    DELAY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn origin_value(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

/// Solver for script interstitials.
pub struct JavascriptSolver {
    engine: Arc<dyn ScriptEngine>,
    solution_ttl: Duration,
}

impl JavascriptSolver {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            solution_ttl: DEFAULT_SOLUTION_TTL,
        }
    }

    pub fn with_solution_ttl(mut self, ttl: Duration) -> Self {
        self.solution_ttl = ttl;
        self
    }
}

#[async_trait]
impl ChallengeSolver for JavascriptSolver {
    fn name(&self) -> &'static str {
        "javascript"
    }

    async fn solve(
        &self,
        ctx: &ChallengeContext<'_>,
        transport: &Arc<dyn Transport>,
    ) -> Result<ChallengeSolution, SolveError> {
        let form = parse_challenge_form(ctx.body)
            .ok_or_else(|| SolveError::failed(ctx.kind, "challenge form not found"))?;
        let host = ctx
            .url
            .host_str()
            .ok_or_else(|| SolveError::failed(ctx.kind, "challenge url has no host"))?;

        let answer = self
            .engine
            .evaluate_challenge(ctx.body, host)
            .map_err(|err| SolveError::failed(ctx.kind, err.to_string()))?;

        let submit_url = ctx
            .url
            .join(&form.action)
            .map_err(|err| SolveError::failed(ctx.kind, format!("invalid form action: {err}")))?;

        let mut fields = form.hidden_fields;
        fields.push((ANSWER_FIELD.to_string(), answer));

        // The interstitial rejects answers submitted before its timer fires.
        if let Some(delay) = extract_page_delay(ctx.body) {
            tokio::time::sleep(delay.min(MAX_PAGE_DELAY)).await;
        }

        let mut request = TransportRequest::form(submit_url, &fields).without_redirects();
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

        Ok(ChallengeSolution::new(cookies, self.solution_ttl))
    }
}
