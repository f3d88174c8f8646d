//! Reqwest-backed default transport.
//!
//! Builds the client with redirects disabled and follows them manually, so
//! `Set-Cookie` headers on intermediate 3xx hops stay observable to solvers
//! and to the session layer.

use async_trait::async_trait;
use http::header::{LOCATION, REFERER};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::{Client, redirect::Policy};
use std::time::Duration;
use url::Url;

use super::{Transport, TransportError, TransportRequest, TransportResponse, WireTiming};

const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default [`Transport`] implementation.
///
/// Reqwest cannot reshape its TLS ClientHello, so the `TlsIdentity` on each
/// request is honored only as far as the stack allows; deployments that need
/// full JA3 impersonation plug in a capable transport behind the same trait.
pub struct ReqwestTransport {
    client: Client,
    max_redirects: usize,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        Ok(Self {
            client,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        })
    }

    /// Wraps an existing client. The client should have redirects disabled;
    /// otherwise intermediate responses are invisible to the solvers.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    async fn send_once(
        &self,
        method: Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, TransportError> {
        let req_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let mut builder = self
            .client
            .request(req_method, url.as_str())
            .headers(to_reqwest_headers(headers)?);
        if let Some(data) = body {
            builder = builder.body(data.to_vec());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = from_reqwest_headers(response.headers())?;
        let final_url = Url::parse(response.url().as_str())
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
            url: final_url,
            timing: WireTiming::default(),
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut response = self
            .send_once(
                request.method.clone(),
                &request.url,
                &request.headers,
                request.body.as_deref(),
            )
            .await?;

        if !request.follow_redirects {
            return Ok(response);
        }

        let mut hops = 0;
        while is_redirect(response.status) && hops < self.max_redirects {
            let Some(next) = redirect_target(&response) else {
                break;
            };
            let mut headers = request.headers.clone();
            if let Ok(referer) = HeaderValue::from_str(response.url.as_str()) {
                headers.insert(REFERER, referer);
            }
            // 303 and the legacy 301/302 demote to GET; 307/308 preserve
            // the method and body.
            let (method, body) = if matches!(response.status, 307 | 308) {
                (request.method.clone(), request.body.as_deref())
            } else {
                (Method::GET, None)
            };
            response = self.send_once(method, &next, &headers, body).await?;
            hops += 1;
        }
        Ok(response)
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

fn redirect_target(response: &TransportResponse) -> Option<Url> {
    let location = response.headers.get(LOCATION)?.to_str().ok()?;
    response.url.join(location).ok()
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(Duration::ZERO)
    } else if err.is_connect() {
        TransportError::ConnectionFailed(err.to_string())
    } else {
        TransportError::Protocol(err.to_string())
    }
}

fn to_reqwest_headers(headers: &HeaderMap) -> Result<reqwest::header::HeaderMap, TransportError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        map.append(name, value);
    }
    Ok(map)
}

fn from_reqwest_headers(map: &reqwest::header::HeaderMap) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in map {
        let name = HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn response(status: u16, url: &str, location: Option<&str>) -> TransportResponse {
        let mut headers = HeaderMap::new();
        if let Some(location) = location {
            headers.insert(LOCATION, HeaderValue::from_str(location).unwrap());
        }
        TransportResponse {
            status,
            headers,
            body: Bytes::new(),
            url: Url::parse(url).unwrap(),
            timing: WireTiming::default(),
        }
    }

    #[test]
    fn resolves_relative_redirect_targets() {
        let redirect = response(302, "https://example.com/challenge", Some("/cleared?ok=1"));
        let target = redirect_target(&redirect).unwrap();
        assert_eq!(target.as_str(), "https://example.com/cleared?ok=1");

        let absolute = response(302, "https://example.com/", Some("https://other.test/next"));
        assert_eq!(
            redirect_target(&absolute).unwrap().as_str(),
            "https://other.test/next"
        );

        let missing = response(302, "https://example.com/", None);
        assert!(redirect_target(&missing).is_none());
    }

    #[test]
    fn redirect_statuses() {
        for status in [301, 302, 303, 307, 308] {
            assert!(is_redirect(status));
        }
        assert!(!is_redirect(200));
        assert!(!is_redirect(304));
    }

    #[test]
    fn header_conversion_preserves_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append(
            http::header::SET_COOKIE,
            HeaderValue::from_static("a=1"),
        );
        headers.append(
            http::header::SET_COOKIE,
            HeaderValue::from_static("b=2"),
        );
        let converted = to_reqwest_headers(&headers).unwrap();
        assert_eq!(converted.get_all(reqwest::header::SET_COOKIE).iter().count(), 2);
        let back = from_reqwest_headers(&converted).unwrap();
        assert_eq!(back.get_all(http::header::SET_COOKIE).iter().count(), 2);
    }
}
