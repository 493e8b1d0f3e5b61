//! HTTP/1.1 request head parsing for the client side of the proxy.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accepted size of a request head, matching common server defaults.
pub const MAX_REQUEST_HEAD_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Headers that apply to a single connection segment and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct HttpRequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

impl HttpRequestHead {
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    /// Request path without query or fragment, for filter-rule matching.
    pub fn path(&self) -> &str {
        self.target
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.target)
    }
}

/// A client stream plus whatever was read past the last consumed message.
pub struct ClientConn<S> {
    pub stream: S,
    pub pending: Vec<u8>,
}

impl<S> ClientConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }
}

/// Read one request head off the connection.
///
/// Returns `Ok(None)` when the client closed cleanly between requests.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    conn: &mut ClientConn<S>,
) -> io::Result<Option<HttpRequestHead>> {
    let mut scanned = 0;
    let head_end = loop {
        if let Some(end) = locate_head_end(&conn.pending, &mut scanned) {
            break end;
        }
        if conn.pending.len() > MAX_REQUEST_HEAD_BYTES {
            return Err(invalid("request head exceeded configured limit"));
        }

        let mut chunk = [0_u8; READ_CHUNK];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            return if conn.pending.is_empty() {
                Ok(None)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed mid request head",
                ))
            };
        }
        conn.pending.extend_from_slice(&chunk[..read]);
    };

    let raw: Vec<u8> = conn.pending.drain(..head_end).collect();
    parse_request_head(&raw).map(Some)
}

/// Scan for the blank line terminating the head. `scanned` remembers how far
/// previous calls got, so each arriving chunk is inspected once.
fn locate_head_end(buf: &[u8], scanned: &mut usize) -> Option<usize> {
    while *scanned + 4 <= buf.len() {
        if buf[*scanned..*scanned + 4] == *b"\r\n\r\n" {
            return Some(*scanned + 4);
        }
        *scanned += 1;
    }
    None
}

/// Parse the request line and headers in one pass, tracking body framing and
/// connection tokens as the header lines stream by.
pub fn parse_request_head(raw: &[u8]) -> io::Result<HttpRequestHead> {
    let text =
        std::str::from_utf8(raw).map_err(|_| invalid("request head was not valid UTF-8"))?;
    let mut lines = text.split("\r\n");

    let (method, target, version) =
        split_request_line(lines.next().ok_or_else(|| invalid("empty request head"))?)?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut close_requested = false;
    let mut keep_alive_requested = false;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid("header line is missing a colon"))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(
                value
                    .parse::<u64>()
                    .map_err(|_| invalid("unparseable Content-Length value"))?,
            );
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = chunked || value_has_token(value, "chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            close_requested = close_requested || value_has_token(value, "close");
            keep_alive_requested = keep_alive_requested || value_has_token(value, "keep-alive");
        }

        headers.push(HttpHeader {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    let body_mode = if chunked {
        HttpBodyMode::Chunked
    } else {
        match content_length {
            Some(0) | None => HttpBodyMode::None,
            Some(length) => HttpBodyMode::ContentLength(length),
        }
    };
    let connection_close =
        close_requested || (version == HttpVersion::Http10 && !keep_alive_requested);

    Ok(HttpRequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

fn split_request_line(line: &str) -> io::Result<(&str, &str, HttpVersion)> {
    let mut fields = line.split(' ').filter(|field| !field.is_empty());
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(method), Some(target), Some(version), None) => {
            Ok((method, target, parse_version(version)?))
        }
        _ => Err(invalid("request line must be method, target, and version")),
    }
}

fn parse_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        _ => Err(invalid("unsupported HTTP version on the client side")),
    }
}

fn value_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}
