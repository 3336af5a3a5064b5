use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::error::ProxyError;
use crate::pac::RouteDecision;
use crate::router::Router;

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Consumes one accepted client connection end to end: plain HTTP requests
/// are forwarded per the routing decision, CONNECT requests become opaque
/// byte tunnels. Both sides are closed when `handle` returns.
pub struct ConnectionHandler {
    router: Arc<Router>,
    idle_timeout: Duration,
}

struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn wants_close(&self) -> bool {
        self.version == "HTTP/1.0"
            || self
                .header("connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close"))
            || self
                .header("proxy-connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }
}

impl ConnectionHandler {
    pub fn new(router: Arc<Router>, idle_timeout: Duration) -> Self {
        Self {
            router,
            idle_timeout,
        }
    }

    pub async fn handle(&self, client: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.serve(client, peer).await {
            debug!("connection from {peer} ended: {e}");
        }
    }

    async fn serve(&self, client: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let (read_half, mut write_half) = client.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let head = match timeout(self.idle_timeout, read_request_head(&mut reader)).await {
                Ok(Ok(Some(head))) => head,
                // client closed between requests
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => {
                    let _ = write_simple_response(&mut write_half, 400, "Bad Request").await;
                    return Err(e);
                }
                Err(_) => {
                    debug!("idle timeout on connection from {peer}");
                    return Ok(());
                }
            };

            if head.method.eq_ignore_ascii_case("CONNECT") {
                return self.handle_connect(reader, write_half, head).await;
            }
            let keep_alive = self
                .forward_request(&mut reader, &mut write_half, head)
                .await?;
            if !keep_alive {
                return Ok(());
            }
        }
    }

    /// Forward one plain request and relay the response. Returns whether the
    /// client connection stays open for another request.
    async fn forward_request(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        client: &mut OwnedWriteHalf,
        head: RequestHead,
    ) -> Result<bool, ProxyError> {
        // Proxy clients send absolute-form targets; anything else is rejected.
        let url = match Url::parse(&head.target) {
            Ok(url) if url.host_str().is_some() => url,
            _ => {
                write_simple_response(client, 400, "Bad Request").await?;
                return Ok(false);
            }
        };
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let decision = self.router.decide(url.as_str(), &host);
        let mut server = match self.router.dial(&host, port, decision).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("{e}");
                write_simple_response(client, 502, "Bad Gateway").await?;
                return Ok(false);
            }
        };

        let client_wants_close = head.wants_close();

        // Origin-form request line when going direct, absolute-form when the
        // next hop is the upstream proxy.
        let request_line = match decision {
            RouteDecision::Direct => {
                let mut path = url.path().to_string();
                if let Some(query) = url.query() {
                    path.push('?');
                    path.push_str(query);
                }
                format!("{} {} {}\r\n", head.method, path, head.version)
            }
            RouteDecision::UseUpstream => {
                format!("{} {} {}\r\n", head.method, head.target, head.version)
            }
        };
        let idle = self.idle_timeout;
        let mut outbound = request_line.into_bytes();
        for (name, value) in &head.headers {
            if is_hop_header(name) {
                continue;
            }
            outbound.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if decision == RouteDecision::UseUpstream {
            outbound.extend_from_slice(
                format!(
                    "Proxy-Authorization: {}\r\n",
                    self.router.credentials().proxy_authorization()
                )
                .as_bytes(),
            );
        }
        // Fresh outbound connection per request.
        outbound.extend_from_slice(b"Connection: close\r\n\r\n");
        server.write_all(&outbound).await?;
        copy_request_body(reader, &mut server, &head, idle).await?;
        server.flush().await?;

        // Relay the response head, rewriting connection headers so client
        // keep-alive survives the per-request outbound connection. Every
        // server-side read is bounded by the idle timeout so a peer that
        // accepts and then goes silent cannot pin this worker.
        let mut server_reader = BufReader::new(server);
        let status_line = timed(idle, "response head", read_line(&mut server_reader))
            .await?
            .ok_or_else(|| ProxyError::Http("server closed before response".to_string()))?;
        let status_code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(502);

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut out = format!("{status_line}\r\n").into_bytes();
        loop {
            let line = timed(idle, "response head", read_line(&mut server_reader))
                .await?
                .ok_or_else(|| ProxyError::Http("server closed mid-response".to_string()))?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                let value = value.trim();
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.parse().ok();
                } else if name.eq_ignore_ascii_case("transfer-encoding")
                    && value.to_ascii_lowercase().contains("chunked")
                {
                    chunked = true;
                }
                if name.eq_ignore_ascii_case("connection")
                    || name.eq_ignore_ascii_case("proxy-connection")
                    || name.eq_ignore_ascii_case("keep-alive")
                {
                    continue;
                }
            }
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        let no_body = head.method.eq_ignore_ascii_case("HEAD")
            || status_code == 204
            || status_code == 304
            || (100..200).contains(&status_code);
        let framed = no_body || chunked || content_length.is_some();
        let keep_alive = framed && !client_wants_close;
        out.extend_from_slice(if keep_alive {
            b"Connection: keep-alive\r\n\r\n"
        } else {
            b"Connection: close\r\n\r\n"
        });
        client.write_all(&out).await?;

        if !no_body {
            if chunked {
                copy_chunked(&mut server_reader, client, idle).await?;
            } else if let Some(len) = content_length {
                copy_exact(&mut server_reader, client, len, idle).await?;
            } else {
                // no length framing: relay until the server closes, then the
                // client connection closes too
                let mut buf = [0u8; 8192];
                loop {
                    let n = timed(idle, "response body", async {
                        Ok(server_reader.read(&mut buf).await?)
                    })
                    .await?;
                    if n == 0 {
                        break;
                    }
                    client.write_all(&buf[..n]).await?;
                }
            }
        }
        client.flush().await?;
        debug!(
            "forwarded {} {} ({:?}): {}",
            head.method, head.target, decision, status_code
        );
        Ok(keep_alive)
    }

    async fn handle_connect(
        &self,
        reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
        head: RequestHead,
    ) -> Result<(), ProxyError> {
        let Some((host, port)) = parse_authority(&head.target) else {
            let _ = write_simple_response(&mut write_half, 400, "Bad Request").await;
            return Err(ProxyError::Http(format!(
                "invalid CONNECT target {:?}",
                head.target
            )));
        };

        let decision = self.router.decide(&format!("https://{host}:{port}/"), &host);
        let mut server = match self.router.establish_tunnel(&host, port, decision).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("CONNECT to {host}:{port} failed: {e}");
                let _ = write_simple_response(&mut write_half, 502, "Bad Gateway").await;
                return Ok(());
            }
        };

        // Bytes the client pipelined behind the CONNECT head belong to the
        // tunnel.
        let buffered = reader.buffer().to_vec();
        if !buffered.is_empty() {
            server.write_all(&buffered).await?;
        }
        let read_half = reader.into_inner();
        let mut client = read_half
            .reunite(write_half)
            .map_err(|e| ProxyError::Http(format!("failed to reunite stream halves: {e}")))?;

        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        match tokio::io::copy_bidirectional(&mut client, &mut server).await {
            Ok((up, down)) => {
                debug!("tunnel to {host}:{port} closed ({up} bytes up, {down} bytes down)")
            }
            Err(e) => debug!("tunnel to {host}:{port} ended: {e}"),
        }
        Ok(())
    }
}

async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let request_line = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(None),
    };
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => {
            (m.to_string(), t.to_string(), v.to_string())
        }
        _ => {
            return Err(ProxyError::Http(format!(
                "malformed request line: {request_line:?}"
            )))
        }
    };

    let mut headers = Vec::new();
    let mut total = request_line.len();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| ProxyError::Http("client closed mid-request".to_string()))?;
        if line.is_empty() {
            break;
        }
        total += line.len();
        if total > MAX_HEAD_BYTES {
            return Err(ProxyError::Http("request head too large".to_string()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProxyError::Http(format!("malformed header line: {line:?}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

/// One CRLF-terminated line, without the terminator. `None` on EOF. The cap
/// is enforced while buffering, so an endless unterminated line errors out
/// instead of growing memory.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (found_newline, used) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                (true, 0)
            } else {
                match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        line.extend_from_slice(&buf[..pos]);
                        (true, pos + 1)
                    }
                    None => {
                        line.extend_from_slice(buf);
                        (false, buf.len())
                    }
                }
            }
        };
        reader.consume(used);
        if line.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Http("line exceeds maximum head size".to_string()));
        }
        if found_newline {
            break;
        }
    }
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Bound one relay read so a silent peer cannot pin the worker forever.
async fn timed<T>(
    limit: Duration,
    what: &'static str,
    fut: impl std::future::Future<Output = Result<T, ProxyError>>,
) -> Result<T, ProxyError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("timed out reading {what}"),
        ))),
    }
}

async fn copy_request_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    head: &RequestHead,
    idle: Duration,
) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if head
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        copy_chunked(reader, writer, idle).await
    } else if let Some(len) = head
        .header("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        copy_exact(reader, writer, len, idle).await
    } else {
        Ok(())
    }
}

async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    idle: Duration,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = timed(idle, "body", async {
            Ok(reader.read(&mut buf[..want]).await?)
        })
        .await?;
        if n == 0 {
            return Err(ProxyError::Http("body truncated".to_string()));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Pass a chunked body through verbatim, including the trailer section.
async fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = timed(idle, "chunk size", read_line(reader))
            .await?
            .ok_or_else(|| ProxyError::Http("chunked body truncated".to_string()))?;
        let size_part = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_part, 16)
            .map_err(|e| ProxyError::Http(format!("invalid chunk size {size_part:?}: {e}")))?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        if size > 0 {
            copy_exact(reader, writer, size as u64, idle).await?;
            let mut crlf = [0u8; 2];
            timed(idle, "chunk delimiter", async {
                reader.read_exact(&mut crlf).await?;
                Ok(())
            })
            .await?;
            writer.write_all(&crlf).await?;
        } else {
            loop {
                let trailer = timed(idle, "chunk trailer", read_line(reader))
                    .await?
                    .ok_or_else(|| ProxyError::Http("chunked trailer truncated".to_string()))?;
                writer.write_all(trailer.as_bytes()).await?;
                writer.write_all(b"\r\n").await?;
                if trailer.is_empty() {
                    return Ok(());
                }
            }
        }
    }
}

fn is_hop_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

fn parse_authority(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

async fn write_simple_response<W>(writer: &mut W, status: u16, reason: &str) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let response =
        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_request_head() {
        let raw = b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/a");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.header("HOST"), Some("example.com"));
        assert!(!head.wants_close());
    }

    #[tokio::test]
    async fn rejects_malformed_request_line() {
        let raw = b"NONSENSE\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn eof_before_request_is_none() {
        let raw: &[u8] = b"";
        let mut reader = BufReader::new(raw);
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn http_1_0_wants_close() {
        let raw = b"GET http://example.com/ HTTP/1.0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert!(head.wants_close());
    }

    #[tokio::test]
    async fn chunked_body_passes_through_verbatim() {
        let raw = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let mut out = Cursor::new(Vec::new());
        copy_chunked(&mut reader, &mut out, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.into_inner(), raw.to_vec());
    }

    #[tokio::test]
    async fn truncated_chunked_body_is_an_error() {
        let raw = b"4\r\nwi";
        let mut reader = BufReader::new(&raw[..]);
        let mut out = Cursor::new(Vec::new());
        assert!(copy_chunked(&mut reader, &mut out, Duration::from_secs(5))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unterminated_header_line_is_rejected_at_the_cap() {
        // single header line past the cap with no newline in sight
        let mut raw = b"GET http://example.com/ HTTP/1.1\r\nX-Junk: ".to_vec();
        raw.resize(raw.len() + MAX_HEAD_BYTES + 1, b'a');
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn unterminated_request_line_is_rejected_at_the_cap() {
        let raw = vec![b'A'; MAX_HEAD_BYTES + 1];
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[test]
    fn connect_target_parsing() {
        assert_eq!(
            parse_authority("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            parse_authority("[::1]:443"),
            Some(("[::1]".to_string(), 443))
        );
        assert_eq!(parse_authority("example.com"), None);
        assert_eq!(parse_authority(":443"), None);
    }

    #[test]
    fn hop_headers_are_stripped() {
        assert!(is_hop_header("Proxy-Authorization"));
        assert!(is_hop_header("proxy-connection"));
        assert!(is_hop_header("Connection"));
        assert!(!is_hop_header("Transfer-Encoding"));
        assert!(!is_hop_header("Host"));
    }
}
