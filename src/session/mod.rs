//! Cookie persistence across requests.
//!
//! Defines the session storage seam together with the in-memory default used
//! when no external store is supplied.

use async_trait::async_trait;
use http::HeaderMap;
use http::header::SET_COOKIE;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Name/value pair carried in `Cookie` request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePair {
    pub name: String,
    pub value: String,
}

impl CookiePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parses the name/value portion of a `Set-Cookie` header, dropping
    /// attributes such as `Path` and `Expires`.
    pub fn from_set_cookie(raw: &str) -> Option<Self> {
        let pair = raw.split(';').next()?;
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, value.trim()))
    }
}

/// Parses a `Cookie` request header (`a=1; b=2`) into pairs.
pub fn parse_cookie_header(raw: &str) -> Vec<CookiePair> {
    raw.split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(CookiePair::new(name, value.trim()))
        })
        .collect()
}

/// Collects cookie pairs from every `Set-Cookie` header in a response.
pub fn cookies_from_headers(headers: &HeaderMap) -> Vec<CookiePair> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(CookiePair::from_set_cookie)
        .collect()
}

/// Renders pairs into a `Cookie` header value. Later pairs win name
/// collisions so freshly issued clearance cookies replace stale ones.
pub fn cookie_header_value(pairs: &[CookiePair]) -> Option<String> {
    let mut ordered: Vec<&CookiePair> = Vec::new();
    for pair in pairs {
        if let Some(existing) = ordered.iter_mut().find(|c| c.name == pair.name) {
            *existing = pair;
        } else {
            ordered.push(pair);
        }
    }
    if ordered.is_empty() {
        return None;
    }
    let rendered: Vec<String> = ordered
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    Some(rendered.join("; "))
}

/// Storage seam for cookie jars. Implementations may persist jars outside
/// the process; a failing backend must degrade to returning nothing rather
/// than surfacing errors into request outcomes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, domain: &str) -> Option<Vec<CookiePair>>;
    async fn save(&self, domain: &str, cookies: Vec<CookiePair>);
}

/// Default process-local store backing the executor when no external
/// collaborator is configured.
#[derive(Clone, Debug, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<HashMap<String, Vec<CookiePair>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, domain: &str) -> Option<Vec<CookiePair>> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(domain).cloned())
            .filter(|jar| !jar.is_empty())
    }

    async fn save(&self, domain: &str, cookies: Vec<CookiePair>) {
        if cookies.is_empty() {
            return;
        }
        if let Ok(mut guard) = self.inner.write() {
            let jar = guard.entry(domain.to_string()).or_default();
            for cookie in cookies {
                if let Some(existing) = jar.iter_mut().find(|c| c.name == cookie.name) {
                    existing.value = cookie.value;
                } else {
                    jar.push(cookie);
                }
            }
        }
    }
}
