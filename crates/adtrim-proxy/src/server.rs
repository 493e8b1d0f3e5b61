//! The TLS listener and per-request proxy logic.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adtrim_filter::ResponseFilter;
use adtrim_tls::classify_tls_error;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, HOST};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::body::{
    decompress_gzip, read_request_body, write_chunk, write_final_chunk,
};
use crate::head::{
    is_hop_by_hop, read_request_head, ClientConn, HttpRequestHead, HttpVersion,
};
use crate::host::UpstreamAllowlist;
use crate::upstream::{build_upstream_client, UpstreamClientConfig};
use crate::ProxyError;

/// Socket deadline for a new connection; cleared once the first request head
/// has arrived.
const NEW_CONNECTION_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct HttpsProxyConfig {
    pub listen: SocketAddr,
    /// Default forwarding target, `host[:port]`.
    pub upstream_host: String,
    /// Additional hosts the `Host` header may select.
    pub upstream_allowlist: Vec<String>,
    pub upstream_client: UpstreamClientConfig,
}

pub struct HttpsProxy {
    listen: SocketAddr,
    upstream_authority: String,
    allowlist: UpstreamAllowlist,
    acceptor: TlsAcceptor,
    filter: Arc<ResponseFilter>,
    client: reqwest::Client,
}

impl HttpsProxy {
    pub fn new(
        config: HttpsProxyConfig,
        tls_config: Arc<ServerConfig>,
        filter: Arc<ResponseFilter>,
    ) -> Result<Arc<Self>, ProxyError> {
        let upstream_authority = config.upstream_host.trim().to_ascii_lowercase();
        if upstream_authority.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "upstream_host must not be empty".to_string(),
            ));
        }

        let client = build_upstream_client(&config.upstream_client)?;
        let allowlist = UpstreamAllowlist::new(&config.upstream_host, &config.upstream_allowlist);

        Ok(Arc::new(Self {
            listen: config.listen,
            upstream_authority,
            allowlist,
            acceptor: TlsAcceptor::from(tls_config),
            filter,
            client,
        }))
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.listen,
                source,
            })?;
        self.serve_with(listener).await
    }

    /// Run until the shutdown channel flips; the listener stops accepting.
    pub async fn run_until_shutdown(
        self: Arc<Self>,
        shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        adtrim_support::serve_until_shutdown(self.run(), shutdown_rx).await
    }

    /// Serve on an already-bound listener. Split out so tests can bind port 0.
    pub async fn serve_with(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        tracing::info!(
            listen = %self.listen,
            upstream = %self.upstream_authority,
            "https proxy listening"
        );
        loop {
            let (tcp, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    continue;
                }
            };
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = proxy.serve_conn(tcp).await {
                    tracing::debug!(%error, %peer, "connection ended with error");
                }
            });
        }
    }

    async fn serve_conn(&self, tcp: TcpStream) -> io::Result<()> {
        let tls_stream = tokio::time::timeout(NEW_CONNECTION_DEADLINE, self.acceptor.accept(tcp))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    "tls handshake missed the new-connection deadline",
                )
            })??;
        let mut conn = ClientConn::new(tls_stream);

        let mut first_use = true;
        loop {
            let head = if first_use {
                match tokio::time::timeout(NEW_CONNECTION_DEADLINE, read_request_head(&mut conn))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connection idle before first request",
                        ))
                    }
                }
            } else {
                read_request_head(&mut conn).await?
            };
            first_use = false;

            let Some(head) = head else {
                return Ok(());
            };
            let client_close = head.connection_close;

            let close_after = self.handle_request(&mut conn, head).await?;
            conn.stream.flush().await?;

            if client_close || close_after {
                let _ = conn.stream.shutdown().await;
                return Ok(());
            }
        }
    }

    /// Proxy one request. Returns whether the connection must close after
    /// the response (unknown-length bodies toward HTTP/1.0 clients).
    async fn handle_request<S>(
        &self,
        conn: &mut ClientConn<S>,
        head: HttpRequestHead,
    ) -> io::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let body = match read_request_body(conn, head.body_mode).await {
            Ok(body) => body,
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(%error, method = %head.method, target = %head.target, "bad request body framing");
                write_simple_response(conn, 400, "bad request").await?;
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        let filtered_path = self.filter.should_filter(head.path());

        let (target, substituted) = self.allowlist.select_target(head.header_value("host"));
        if substituted {
            tracing::warn!(
                requested = head.header_value("host").unwrap_or_default(),
                fallback = %target,
                "host not allow-listed, forwarding to default upstream"
            );
        }
        let authority = if target == self.allowlist.default_host() {
            self.upstream_authority.clone()
        } else {
            target.clone()
        };

        let Ok(url) = reqwest::Url::parse(&format!("https://{}{}", authority, head.target)) else {
            write_simple_response(conn, 400, "bad request").await?;
            return Ok(false);
        };
        let Ok(method) = reqwest::Method::from_bytes(head.method.as_bytes()) else {
            write_simple_response(conn, 400, "bad request").await?;
            return Ok(false);
        };
        let Some(outbound_headers) = build_outbound_headers(&head, &target, filtered_path) else {
            write_simple_response(conn, 400, "bad request").await?;
            return Ok(false);
        };

        let request = self
            .client
            .request(method.clone(), url)
            .headers(outbound_headers)
            .body(body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                let detail = error_chain_text(&error);
                let class = classify_tls_error(&detail);
                if class.is_tls_related() {
                    tracing::warn!(
                        method = %head.method,
                        path = head.path(),
                        class = class.code(),
                        detail,
                        "upstream TLS error"
                    );
                } else {
                    tracing::warn!(
                        method = %head.method,
                        path = head.path(),
                        detail,
                        "upstream error"
                    );
                }
                write_simple_response(conn, 502, "upstream error").await?;
                return Ok(false);
            }
        };

        let head_only = method == reqwest::Method::HEAD;
        if filtered_path {
            self.relay_filtered(conn, head.path(), response, head_only)
                .await
        } else {
            relay_streaming(conn, response, head.version, head_only).await
        }
    }

    /// Buffered path: read everything, undo gzip, filter, re-frame.
    async fn relay_filtered<S>(
        &self,
        conn: &mut ClientConn<S>,
        path: &str,
        response: reqwest::Response,
        head_only: bool,
    ) -> io::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let status = response.status();
        let upstream_headers = response.headers().clone();

        let mut body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(error) => {
                tracing::warn!(path, error = error_chain_text(&error), "upstream body read failed");
                write_simple_response(conn, 502, "read error").await?;
                return Ok(false);
            }
        };

        let mut encoding_cleared = false;
        let content_encoding = upstream_headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase());
        if content_encoding.as_deref() == Some("gzip") {
            match decompress_gzip(&body) {
                Ok(decoded) => {
                    body = decoded;
                    encoding_cleared = true;
                }
                Err(error) => {
                    tracing::debug!(path, %error, "gzip decode failed, passing body through");
                }
            }
        }

        let before = body.len();
        let body = self.filter.apply(path, &body);
        if body.len() != before {
            tracing::debug!(path, before, after = body.len(), "filtered response body");
        }

        let mut header_lines = Vec::new();
        for (name, value) in &upstream_headers {
            if is_hop_by_hop(name.as_str())
                || name == &CONTENT_LENGTH
                || (encoding_cleared && name == &CONTENT_ENCODING)
            {
                continue;
            }
            header_lines.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        header_lines.push(("content-length".to_string(), body.len().to_string()));

        write_response_head(conn, status, &header_lines).await?;
        if !head_only {
            conn.stream.write_all(&body).await?;
        }
        Ok(false)
    }
}

fn build_outbound_headers(
    head: &HttpRequestHead,
    target_host: &str,
    filtered_path: bool,
) -> Option<HeaderMap> {
    let mut outbound = HeaderMap::new();
    for header in &head.headers {
        if is_hop_by_hop(&header.name) || header.name.eq_ignore_ascii_case("host") {
            continue;
        }
        if filtered_path && header.name.eq_ignore_ascii_case("accept-encoding") {
            continue;
        }
        let name = HeaderName::from_bytes(header.name.as_bytes()).ok()?;
        let value = HeaderValue::from_str(&header.value).ok()?;
        outbound.append(name, value);
    }
    outbound.insert(HOST, HeaderValue::from_str(target_host).ok()?);
    Some(outbound)
}

/// Unbuffered path: copy headers, then relay body chunks as they arrive.
async fn relay_streaming<S>(
    conn: &mut ClientConn<S>,
    mut response: reqwest::Response,
    client_version: HttpVersion,
    head_only: bool,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let status = response.status();

    let mut header_lines = Vec::new();
    let mut has_length = false;
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if name == &CONTENT_LENGTH {
            has_length = true;
        }
        header_lines.push((
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        ));
    }

    let bodyless =
        head_only || status.is_informational() || status.as_u16() == 204 || status.as_u16() == 304;

    // Without an upstream length we frame the body ourselves: chunked for
    // HTTP/1.1 clients, close-delimited for HTTP/1.0.
    let chunked = !bodyless && !has_length && client_version == HttpVersion::Http11;
    let close_delimited = !bodyless && !has_length && client_version == HttpVersion::Http10;
    if chunked {
        header_lines.push(("transfer-encoding".to_string(), "chunked".to_string()));
    }
    if close_delimited {
        header_lines.push(("connection".to_string(), "close".to_string()));
    }

    write_response_head(conn, status, &header_lines).await?;
    if bodyless {
        return Ok(false);
    }

    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(error) => {
                // Headers are already on the wire; all we can do is cut the
                // connection so the client sees the truncation.
                tracing::warn!(error = error_chain_text(&error), "upstream stream failed mid-body");
                return Err(io::Error::other("upstream stream failed mid-body"));
            }
        };
        if chunked {
            write_chunk(&mut conn.stream, &chunk).await?;
        } else {
            conn.stream.write_all(&chunk).await?;
        }
    }
    if chunked {
        write_final_chunk(&mut conn.stream).await?;
    }

    Ok(close_delimited)
}

async fn write_response_head<S>(
    conn: &mut ClientConn<S>,
    status: reqwest::StatusCode,
    headers: &[(String, String)],
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    conn.stream.write_all(head.as_bytes()).await
}

async fn write_simple_response<S>(
    conn: &mut ClientConn<S>,
    status: u16,
    body: &str,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = match status {
        400 => "Bad Request",
        502 => "Bad Gateway",
        _ => "Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\n\r\n",
        body.len() + 1
    );
    conn.stream.write_all(head.as_bytes()).await?;
    conn.stream.write_all(body.as_bytes()).await?;
    conn.stream.write_all(b"\n").await
}

fn error_chain_text(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}
