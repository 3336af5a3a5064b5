use base64::{engine::general_purpose, Engine as _};
use url::Url;

use crate::error::ProxyError;

/// Upstream proxy endpoint plus the Basic credentials presented to it.
///
/// Immutable for the lifetime of a running server; configuration changes only
/// apply to the next start.
#[derive(Debug, Clone)]
pub struct Credentials {
    upstream: Url,
    authority: String,
    auth_header: String,
}

impl Credentials {
    pub fn new(upstream_url: &str, username: &str, password: &str) -> Result<Self, ProxyError> {
        let upstream = Url::parse(upstream_url)?;
        let host = upstream.host_str().ok_or_else(|| {
            ProxyError::Config(format!("upstream proxy URL {upstream_url} has no host"))
        })?;
        let port = upstream.port_or_known_default().unwrap_or(8080);
        let authority = format!("{host}:{port}");
        let encoded = general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Ok(Self {
            upstream,
            authority,
            auth_header: format!("Basic {encoded}"),
        })
    }

    pub fn url(&self) -> &Url {
        &self.upstream
    }

    /// host:port to dial for the upstream hop.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Precomputed `Proxy-Authorization` header value.
    pub fn proxy_authorization(&self) -> &str {
        &self.auth_header
    }
}
