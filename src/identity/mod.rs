//! Browser identity data.
//!
//! Supplies the ordered header sets and TLS parameters attached to every
//! attempt. The provider seam keeps identity data pluggable; the built-in
//! profiles cover current desktop Chrome and Firefox.

use serde::{Deserialize, Serialize};
use url::Url;

/// TLS parameters handed to the transport for impersonation. Opaque to the
/// orchestrator; a capable transport maps these onto its handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsIdentity {
    pub ja3: String,
    pub cipher_suites: Vec<String>,
    pub alpn_protocols: Vec<String>,
    pub tls_extensions: Vec<u16>,
}

/// A complete browser network identity: headers in emission order plus the
/// TLS shape that matches them.
#[derive(Debug, Clone)]
pub struct BrowserIdentity {
    pub name: String,
    pub ordered_headers: Vec<(String, String)>,
    pub tls: TlsIdentity,
}

impl BrowserIdentity {
    pub fn chrome() -> Self {
        Self {
            name: "chrome".into(),
            ordered_headers: vec![
                (
                    "sec-ch-ua".into(),
                    r#""Chromium";v="131", "Google Chrome";v="131", "Not_A Brand";v="24""#.into(),
                ),
                ("sec-ch-ua-mobile".into(), "?0".into()),
                ("sec-ch-ua-platform".into(), r#""Windows""#.into()),
                ("upgrade-insecure-requests".into(), "1".into()),
                (
                    "user-agent".into(),
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                        .into(),
                ),
                (
                    "accept".into(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,\
                     image/apng,*/*;q=0.8"
                        .into(),
                ),
                ("accept-language".into(), "en-US,en;q=0.9".into()),
                ("accept-encoding".into(), "gzip, deflate, br".into()),
            ],
            tls: TlsIdentity {
                ja3: "771,4866-4865-4867-49196-49195-52393,0-11-10-35-13-45-16-43,29-23-24,0"
                    .into(),
                cipher_suites: vec![
                    "TLS_AES_128_GCM_SHA256".into(),
                    "TLS_AES_256_GCM_SHA384".into(),
                    "TLS_CHACHA20_POLY1305_SHA256".into(),
                ],
                alpn_protocols: vec!["h2".into(), "http/1.1".into()],
                tls_extensions: vec![0, 11, 10, 35, 13, 45, 16, 43],
            },
        }
    }

    pub fn firefox() -> Self {
        Self {
            name: "firefox".into(),
            ordered_headers: vec![
                (
                    "user-agent".into(),
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 \
                     Firefox/133.0"
                        .into(),
                ),
                (
                    "accept".into(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,\
                     image/webp,*/*;q=0.8"
                        .into(),
                ),
                ("accept-language".into(), "en-US,en;q=0.5".into()),
                ("accept-encoding".into(), "gzip, deflate, br".into()),
                ("upgrade-insecure-requests".into(), "1".into()),
            ],
            tls: TlsIdentity {
                ja3: "771,4866-4865-4867-49196-49200,0-11-10-35-13-27,23-24,0".into(),
                cipher_suites: vec![
                    "TLS_AES_128_GCM_SHA256".into(),
                    "TLS_AES_256_GCM_SHA384".into(),
                    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256".into(),
                ],
                alpn_protocols: vec!["h2".into(), "http/1.1".into()],
                tls_extensions: vec![0, 11, 10, 35, 13, 27],
            },
        }
    }
}

/// Read-only identity source consumed by the executor. `headers_for` returns
/// headers in browser emission order; implementations must stay cheap since
/// this runs once per attempt.
pub trait FingerprintProvider: Send + Sync {
    fn headers_for(&self, url: &Url) -> Vec<(String, String)>;
    fn tls_identity(&self) -> TlsIdentity;
}

/// Provider that serves one fixed identity for the whole session.
#[derive(Debug, Clone)]
pub struct StaticIdentityProvider {
    identity: BrowserIdentity,
}

impl StaticIdentityProvider {
    pub fn new(identity: BrowserIdentity) -> Self {
        Self { identity }
    }

    pub fn chrome() -> Self {
        Self::new(BrowserIdentity::chrome())
    }

    pub fn firefox() -> Self {
        Self::new(BrowserIdentity::firefox())
    }

    pub fn identity(&self) -> &BrowserIdentity {
        &self.identity
    }
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        Self::chrome()
    }
}

impl FingerprintProvider for StaticIdentityProvider {
    fn headers_for(&self, _url: &Url) -> Vec<(String, String)> {
        self.identity.ordered_headers.clone()
    }

    fn tls_identity(&self) -> TlsIdentity {
        self.identity.tls.clone()
    }
}
