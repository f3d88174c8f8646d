//! Inline challenge classification.
//!
//! Pure pattern matching over a (status, headers, body) triple. The
//! orchestrator runs this on every response before deciding whether real
//! content came back or a mitigation page did. No state, no I/O.

use http::HeaderMap;
use http::header::SERVER;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Challenge categories the orchestrator routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Ordinary content, no mitigation detected.
    None,
    /// The target signalled 429; handled by backoff, not by a solver.
    RateLimit,
    /// Script-execution interstitial with an embedded options object.
    Javascript,
    /// Interactive CAPTCHA widget.
    Turnstile,
    /// Browser-verification interstitial without a solvable form.
    Managed,
    /// Vendor-mitigated response matching no known signature.
    Unknown,
}

impl ChallengeKind {
    /// True for kinds the solver registry may be asked to resolve.
    pub fn is_solvable_kind(self) -> bool {
        matches!(
            self,
            ChallengeKind::Javascript
                | ChallengeKind::Turnstile
                | ChallengeKind::Managed
                | ChallengeKind::Unknown
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ChallengeKind::None => "none",
            ChallengeKind::RateLimit => "rate_limit",
            ChallengeKind::Javascript => "javascript",
            ChallengeKind::Turnstile => "turnstile",
            ChallengeKind::Managed => "managed",
            ChallengeKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Script-challenge signatures: the embedded options object, the
/// challenge-platform orchestrator script, and the interstitial form.
static JAVASCRIPT_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"window\._cf_chl_opt\s*=",
        r#"cpo\.src\s*=\s*['"]/cdn-cgi/challenge-platform/.*?orchestrate/jsch/v1"#,
        r#"<form[^>]*id="challenge-form"[^>]*action="/[^"]*__cf_chl_(?:f|rt)_tk="#,
        r"setTimeout\(function\(\)\s*\{\s*var.*?\.submit\(\)",
    ]
    .iter()
    .map(|pattern| build_regex(pattern))
    .collect()
});

static TURNSTILE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"class="cf-turnstile""#,
        r#"src="https://challenges\.cloudflare\.com/turnstile/v0/api\.js"#,
        r"cf-turnstile-response",
    ]
    .iter()
    .map(|pattern| build_regex(pattern))
    .collect()
});

static MANAGED_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"checking your browser",
        r#"cpo\.src\s*=\s*['"]/cdn-cgi/challenge-platform/.*?orchestrate/(?:captcha|managed)/v1"#,
        r"window\._cf_chl_ctx\s*=",
        r#"<div[^>]*class="cf-browser-verification"#,
    ]
    .iter()
    .map(|pattern| build_regex(pattern))
    .collect()
});

/// Classifies one response. First match wins; later rules never override
/// earlier ones even when a page carries several signals at once.
pub fn classify(status: u16, headers: &HeaderMap, body: &str) -> ChallengeKind {
    if status == 429 {
        return ChallengeKind::RateLimit;
    }

    let vendor = has_vendor_signals(headers);
    // A clean 2xx is content even if the page happens to talk about
    // challenges; only vendor-stamped responses get body inspection.
    if (200..300).contains(&status) && !vendor {
        return ChallengeKind::None;
    }

    if JAVASCRIPT_MARKERS.iter().any(|re| re.is_match(body)) {
        return ChallengeKind::Javascript;
    }
    if TURNSTILE_MARKERS.iter().any(|re| re.is_match(body)) {
        return ChallengeKind::Turnstile;
    }
    if matches!(status, 403 | 503) && MANAGED_MARKERS.iter().any(|re| re.is_match(body)) {
        return ChallengeKind::Managed;
    }
    if vendor && matches!(status, 403 | 503) {
        return ChallengeKind::Unknown;
    }
    ChallengeKind::None
}

/// Checks for protection-vendor response headers.
pub fn has_vendor_signals(headers: &HeaderMap) -> bool {
    let server_is_vendor = headers
        .get(SERVER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("cloudflare"));
    server_is_vendor || headers.contains_key("cf-ray") || headers.contains_key("cf-mitigated")
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid challenge signature regex `{}`: {}", pattern, err))
}
