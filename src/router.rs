use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::credentials::Credentials;
use crate::error::ProxyError;
use crate::pac::{PacEvaluator, RouteDecision};

/// Combines the PAC decision with the upstream credentials to produce a
/// per-request route and the matching outbound connection.
pub struct Router {
    credentials: Credentials,
    pac: Option<PacEvaluator>,
    connect_timeout: Duration,
}

impl Router {
    pub fn new(
        credentials: Credentials,
        pac: Option<PacEvaluator>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            pac,
            connect_timeout,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Route one request. With no PAC script loaded everything goes upstream.
    pub fn decide(&self, url: &str, host: &str) -> RouteDecision {
        match &self.pac {
            Some(pac) => pac.find_route(url, host),
            None => RouteDecision::UseUpstream,
        }
    }

    /// Open the TCP connection a plain request is written to: the origin for
    /// a direct route, the upstream proxy otherwise.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        decision: RouteDecision,
    ) -> Result<TcpStream, ProxyError> {
        let target = match decision {
            RouteDecision::Direct => format!("{host}:{port}"),
            RouteDecision::UseUpstream => self.credentials.authority().to_string(),
        };
        match timeout(self.connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::Dial { target, source: e }),
            Err(_) => Err(ProxyError::Dial {
                target,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    /// Open a raw byte tunnel to `host:port`. An upstream route performs the
    /// authenticated CONNECT handshake first and hands back the stream once
    /// the upstream reports the tunnel established.
    pub async fn establish_tunnel(
        &self,
        host: &str,
        port: u16,
        decision: RouteDecision,
    ) -> Result<TcpStream, ProxyError> {
        let mut stream = self.dial(host, port, decision).await?;
        if decision == RouteDecision::Direct {
            return Ok(stream);
        }

        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Authorization: {}\r\n\r\n",
            self.credentials.proxy_authorization()
        );
        stream.write_all(request.as_bytes()).await?;

        // The handshake is part of connection establishment; an upstream that
        // accepts and then goes silent must not hang the worker.
        let head = match timeout(self.connect_timeout, read_response_head(&mut stream)).await {
            Ok(head) => head?,
            Err(_) => {
                return Err(ProxyError::Http(format!(
                    "upstream proxy timed out during CONNECT handshake to {host}:{port}"
                )))
            }
        };
        let status_line = head.lines().next().unwrap_or("");
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(ProxyError::Http(format!(
                "upstream proxy rejected CONNECT to {host}:{port}: {status_line}"
            )));
        }
        debug!("tunnel established to {host}:{port} via upstream proxy");
        Ok(stream)
    }
}

/// Read the CONNECT response head one byte at a time so no tunnel payload is
/// consumed past the terminating blank line.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, ProxyError> {
    let mut head: Vec<u8> = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(ProxyError::Http(
                "CONNECT response head too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::Http(
                "upstream proxy closed during CONNECT handshake".to_string(),
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_without_pac() -> Router {
        let credentials = Credentials::new("http://proxy.corp:3128", "alice", "secret").unwrap();
        Router::new(credentials, None, Duration::from_secs(5))
    }

    #[test]
    fn no_pac_always_routes_upstream() {
        let router = router_without_pac();
        for (url, host) in [
            ("http://example.com/", "example.com"),
            ("http://intranet/", "intranet"),
            ("https://10.0.0.1:443/", "10.0.0.1"),
        ] {
            assert_eq!(router.decide(url, host), RouteDecision::UseUpstream);
        }
    }

    #[test]
    fn pac_decision_is_forwarded() {
        let credentials = Credentials::new("http://proxy.corp:3128", "alice", "secret").unwrap();
        let pac = PacEvaluator::load(
            r#"function FindProxyForURL(url, host) { return "DIRECT"; }"#,
        )
        .unwrap();
        let router = Router::new(credentials, Some(pac), Duration::from_secs(5));
        assert_eq!(
            router.decide("http://example.com/", "example.com"),
            RouteDecision::Direct
        );
    }
}
