//! HTTP proxy: CONNECT tunnels and absolute-URL requests

use super::relay::relay;
use super::{accept, Address, ProxyError, ProxyState, TrafficStats};
use crate::config::ProxyConfig;
use crate::context::GatewayContext;
use crate::credentials::CredentialStore;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const RESPONSE_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
Proxy-Authenticate: Basic realm=\"cellgate\"\r\n\r\n";

/// Header lines accepted before the request is rejected
const MAX_HEADERS: usize = 128;

/// Bytes of request line plus headers accepted before the request is rejected
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// HTTP proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

/// Request head as received, minus `Proxy-Authorization`
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<String>,
    proxy_authorization: Option<String>,
}

impl HttpProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        ctx: GatewayContext,
        credentials: Arc<CredentialStore>,
        config: ProxyConfig,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state: ProxyState::new(ctx, credentials, config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        self.state.stats.clone()
    }

    /// Accept connections until `shutdown`
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = accept(&self.listener, "HTTP proxy") => accepted,
            };
            debug!("New HTTP proxy connection from {}", peer_addr);

            let state = self.state.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = handle_connection(stream, state) => {
                        if let Err(e) = result {
                            debug!("HTTP proxy connection from {} failed: {}", peer_addr, e);
                        }
                    }
                }
            });
        }
        info!("HTTP proxy server stopped");
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ProxyState>) -> Result<(), ProxyError> {
    let mut reader = BufReader::new(stream);

    let head = match read_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e) => {
            let _ = reader.get_mut().write_all(RESPONSE_BAD_REQUEST).await;
            return Err(e);
        }
    };

    let offered = head.proxy_authorization.as_deref().and_then(basic_credentials);
    let permitted = state
        .credentials
        .permits(offered.as_ref().map(|(u, p)| (u.as_str(), p.as_str())));
    if !permitted {
        reader.get_mut().write_all(RESPONSE_AUTH_REQUIRED).await?;
        return Err(ProxyError::AuthenticationFailed);
    }

    let connect = head.method.eq_ignore_ascii_case("CONNECT");
    let target = if connect {
        Address::parse_authority(&head.target, None)
    } else {
        absolute_url_authority(&head.target)
            .and_then(|authority| Address::parse_authority(authority, Some(80)))
    };
    let target = match target {
        Ok(target) => target,
        Err(e) => {
            reader.get_mut().write_all(RESPONSE_BAD_REQUEST).await?;
            return Err(e);
        }
    };

    debug!("HTTP {} {}", head.method, target);
    let mut upstream = match state.connect(&target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            reader.get_mut().write_all(RESPONSE_BAD_GATEWAY).await?;
            return Err(e.into());
        }
    };

    if connect {
        reader.get_mut().write_all(RESPONSE_ESTABLISHED).await?;
    } else {
        let serialized = head.serialize();
        upstream.write_all(&serialized).await?;
        state.stats.add_out(serialized.len() as u64);
    }

    // bytes the client pipelined behind the header block
    let buffered = reader.buffer().to_vec();
    let client = reader.into_inner();
    if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
        state.stats.add_out(buffered.len() as u64);
    }

    let (out, inn) = relay(
        client,
        upstream,
        &state.stats,
        state.config.buffer_size,
        state.config.idle_timeout(),
    )
    .await;
    debug!("HTTP {} closed ({} bytes out, {} bytes in)", target, out, inn);
    Ok(())
}

/// Request line and headers; `None` when the client closed without sending any
async fn read_head(reader: &mut BufReader<TcpStream>) -> Result<Option<RequestHead>, ProxyError> {
    let mut budget = MAX_HEAD_BYTES;
    let mut request_line = String::new();
    if read_line_limited(reader, &mut request_line, &mut budget).await? == 0 {
        return Ok(None);
    }

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/") => {
            (method.to_string(), target.to_string(), version.to_string())
        }
        _ => {
            return Err(ProxyError::InvalidRequest(format!(
                "request line {:?}",
                request_line.trim_end()
            )))
        }
    };

    let mut headers = Vec::new();
    let mut proxy_authorization = None;
    loop {
        let mut line = String::new();
        if read_line_limited(reader, &mut line, &mut budget).await? == 0 {
            return Err(ProxyError::InvalidRequest("truncated headers".to_string()));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProxyError::InvalidRequest("too many headers".to_string()));
        }

        match line.split_once(':') {
            Some((name, value)) if name.trim().eq_ignore_ascii_case("proxy-authorization") => {
                proxy_authorization = Some(value.trim().to_string());
            }
            _ => headers.push(line.to_string()),
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        proxy_authorization,
    }))
}

/// `read_line` that fails once the head outgrows `budget`
async fn read_line_limited(
    reader: &mut BufReader<TcpStream>,
    line: &mut String,
    budget: &mut usize,
) -> Result<usize, ProxyError> {
    let too_large = || ProxyError::InvalidRequest("request head too large".to_string());
    if *budget == 0 {
        return Err(too_large());
    }

    let n = (&mut *reader).take(*budget as u64).read_line(line).await?;
    *budget -= n;
    if *budget == 0 && !line.ends_with('\n') {
        return Err(too_large());
    }
    Ok(n)
}

impl RequestHead {
    /// Original request line and headers, ready for the upstream
    fn serialize(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for header in &self.headers {
            out.push_str(header);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Authority of an `http://` URL
fn absolute_url_authority(url: &str) -> Result<&str, ProxyError> {
    let invalid = || ProxyError::InvalidRequest(format!("not an absolute http URL: {}", url));

    let scheme_end = url.find("://").ok_or_else(invalid)?;
    if !url[..scheme_end].eq_ignore_ascii_case("http") {
        return Err(invalid());
    }
    let rest = &url[scheme_end + 3..];
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    // drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(invalid());
    }
    Ok(authority)
}

/// `Basic base64(user:pass)`
fn basic_credentials(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::loopback_context;

    #[test]
    fn test_absolute_url_authority() {
        assert_eq!(absolute_url_authority("http://example.com/a?b").unwrap(), "example.com");
        assert_eq!(absolute_url_authority("HTTP://example.com:8080").unwrap(), "example.com:8080");
        assert_eq!(absolute_url_authority("http://u:p@[::1]:81/").unwrap(), "[::1]:81");
        assert!(absolute_url_authority("/relative").is_err());
        assert!(absolute_url_authority("https://example.com/").is_err());
        assert!(absolute_url_authority("http:///path").is_err());
    }

    #[test]
    fn test_basic_credentials() {
        // "alice:s3cret"
        assert_eq!(
            basic_credentials("Basic YWxpY2U6czNjcmV0"),
            Some(("alice".to_string(), "s3cret".to_string()))
        );
        assert_eq!(basic_credentials("Bearer YWxpY2U6czNjcmV0"), None);
        assert_eq!(basic_credentials("Basic !!!"), None);
    }

    async fn start(credentials: CredentialStore) -> (SocketAddr, CancellationToken) {
        let server = HttpProxyServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            loopback_context(),
            Arc::new(credentials),
            ProxyConfig::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let run_token = token.clone();
        tokio::spawn(async move { server.run(run_token).await });
        (addr, token)
    }

    async fn exchange(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        let (proxy, token) = start(CredentialStore::new()).await;
        let response = exchange(proxy, b"GARBAGE\r\n\r\n").await;
        assert_eq!(response, RESPONSE_BAD_REQUEST);
        token.cancel();
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let (proxy, token) = start(CredentialStore::new()).await;

        // request line that never ends
        let response = exchange(proxy, &vec![b'A'; MAX_HEAD_BYTES]).await;
        assert_eq!(response, RESPONSE_BAD_REQUEST);

        // valid request line, then one endless header
        let mut request = b"GET http://127.0.0.1:9/ HTTP/1.1\r\n".to_vec();
        request.resize(MAX_HEAD_BYTES, b'H');
        let response = exchange(proxy, &request).await;
        assert_eq!(response, RESPONSE_BAD_REQUEST);
        token.cancel();
    }

    #[tokio::test]
    async fn test_auth_required() {
        let (proxy, token) = start(CredentialStore::with_entries([("alice", "s3cret")])).await;

        let response = exchange(proxy, b"CONNECT 127.0.0.1:9 HTTP/1.1\r\n\r\n").await;
        assert_eq!(response, RESPONSE_AUTH_REQUIRED);

        let response = exchange(
            proxy,
            b"CONNECT 127.0.0.1:9 HTTP/1.1\r\nProxy-Authorization: Basic YWxpY2U6d3Jvbmc=\r\n\r\n",
        )
        .await;
        assert_eq!(response, RESPONSE_AUTH_REQUIRED);
        token.cancel();
    }

    #[tokio::test]
    async fn test_plain_request_strips_proxy_authorization() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (proxy, token) = start(CredentialStore::with_entries([("alice", "s3cret")])).await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut reader = BufReader::new(&mut stream);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            head
        });

        let request = format!(
            "GET http://{}/index.html HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n\r\n",
            upstream_addr, upstream_addr
        );
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();

        let head = server.await.unwrap();
        assert_eq!(
            head,
            format!(
                "GET http://{}/index.html HTTP/1.1\r\nHost: {}\r\n\r\n",
                upstream_addr, upstream_addr
            )
        );

        let mut response = vec![0u8; 27];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.1 204 No Content\r\n\r\n");
        token.cancel();
    }
}
