//! Wire transport seam.
//!
//! The orchestrator never opens connections itself; it hands fully assembled
//! requests to a [`Transport`], which owns pooling, TLS impersonation, and
//! protocol negotiation for the identity attached to each request.

pub mod executor;
pub mod reqwest_client;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::identity::TlsIdentity;

pub use executor::{AttemptReport, AttemptTiming, RequestExecutor};
pub use reqwest_client::ReqwestTransport;

/// One fully assembled wire request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub tls: TlsIdentity,
    /// Solvers disable this so `Set-Cookie` on 3xx hops stays observable.
    pub follow_redirects: bool,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            tls: TlsIdentity::default(),
            follow_redirects: true,
        }
    }

    /// Builds an urlencoded form POST, the shape challenge submissions take.
    pub fn form(url: Url, fields: &[(String, String)]) -> Self {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in fields {
            serializer.append_pair(name, value);
        }
        let mut request = Self::new(Method::POST, url);
        request.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        request.body = Some(Bytes::from(serializer.finish()));
        request
    }

    pub fn with_tls(mut self, tls: TlsIdentity) -> Self {
        self.tls = tls;
        self
    }

    pub fn without_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }
}

/// Wire timing splits a transport can observe. Totals are measured by the
/// executor; these stay `None` when the client library hides the handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireTiming {
    pub connect: Option<Duration>,
    pub tls_handshake: Option<Duration>,
}

/// Response as it came off the wire, after decompression.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final URL after any redirects the transport followed.
    pub url: Url,
    pub timing: WireTiming,
}

impl TransportResponse {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures at the wire layer, categorized for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The external HTTP/TLS client. Implementations are expected to honor the
/// `TlsIdentity` on each request as far as their stack allows.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
