//! Request body reading and response body framing.

use std::io;
use std::io::Read;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::head::{ClientConn, HttpBodyMode};

/// Upper bound on a buffered request body.
pub const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Read the full request body according to the head's framing.
pub async fn read_request_body<S: AsyncRead + Unpin>(
    conn: &mut ClientConn<S>,
    mode: HttpBodyMode,
) -> io::Result<Vec<u8>> {
    match mode {
        HttpBodyMode::None => Ok(Vec::new()),
        HttpBodyMode::ContentLength(length) => {
            let length = usize::try_from(length).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "Content-Length does not fit")
            })?;
            if length > MAX_REQUEST_BODY_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request body exceeds configured limit",
                ));
            }
            read_exact_buffered(conn, length).await
        }
        HttpBodyMode::Chunked => read_chunked_body(conn).await,
    }
}

async fn read_exact_buffered<S: AsyncRead + Unpin>(
    conn: &mut ClientConn<S>,
    length: usize,
) -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(length.min(64 * 1024));

    let take = length.min(conn.pending.len());
    body.extend(conn.pending.drain(..take));

    while body.len() < length {
        let mut chunk = vec![0_u8; (length - body.len()).min(64 * 1024)];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid request body",
            ));
        }
        body.extend_from_slice(&chunk[..read]);
    }
    Ok(body)
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    conn: &mut ClientConn<S>,
) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(conn).await?;
        let size_text = size_line
            .split(';')
            .next()
            .map(str::trim)
            .unwrap_or_default();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line")
        })?;

        if size == 0 {
            // Trailer section: discard lines until the terminating blank one.
            loop {
                let trailer = read_line(conn).await?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        if body.len() + size > MAX_REQUEST_BODY_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body exceeds configured limit",
            ));
        }
        let chunk = read_exact_buffered(conn, size).await?;
        body.extend_from_slice(&chunk);

        let separator = read_exact_buffered(conn, 2).await?;
        if separator != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk data not terminated by CRLF",
            ));
        }
    }
}

async fn read_line<S: AsyncRead + Unpin>(conn: &mut ClientConn<S>) -> io::Result<String> {
    let mut line = Vec::new();
    loop {
        while let Some(position) = conn.pending.iter().position(|byte| *byte == b'\n') {
            line.extend(conn.pending.drain(..=position));
            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                line.pop();
            }
            return String::from_utf8(line).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "chunk framing was not UTF-8")
            });
        }
        if conn.pending.len() > 8 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk size line exceeded limit",
            ));
        }
        let mut chunk = [0_u8; 1024];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid chunked body",
            ));
        }
        conn.pending.extend_from_slice(&chunk[..read]);
    }
}

/// Write one chunk in our own chunked framing.
pub async fn write_chunk<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> io::Result<()> {
    stream
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    stream.write_all(data).await?;
    stream.write_all(b"\r\n").await
}

pub async fn write_final_chunk<W: AsyncWrite + Unpin>(stream: &mut W) -> io::Result<()> {
    stream.write_all(b"0\r\n\r\n").await
}

/// Decompress a gzip body in one shot.
pub fn decompress_gzip(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn conn_with(bytes: &[u8]) -> ClientConn<tokio::io::DuplexStream> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, bytes)
            .await
            .expect("write");
        drop(client);
        ClientConn::new(server)
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let mut conn = conn_with(b"hello world").await;
        let body = read_request_body(&mut conn, HttpBodyMode::ContentLength(11))
            .await
            .expect("body");
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn reads_chunked_body_with_trailers() {
        let mut conn =
            conn_with(b"5\r\nhello\r\n6\r\n world\r\n0\r\nExpires: never\r\n\r\n").await;
        let body = read_request_body(&mut conn, HttpBodyMode::Chunked)
            .await
            .expect("body");
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut conn = conn_with(b"hel").await;
        let result = read_request_body(&mut conn, HttpBodyMode::ContentLength(11)).await;
        assert!(result.is_err());
    }

    #[test]
    fn gzip_round_trip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"{\"ads\":1,\"v\":2}").expect("encode");
        let compressed = encoder.finish().expect("finish");

        let decoded = decompress_gzip(&compressed).expect("decode");
        assert_eq!(decoded, b"{\"ads\":1,\"v\":2}");
    }

    #[test]
    fn gzip_decode_failure_surfaces_as_error() {
        assert!(decompress_gzip(b"definitely not gzip").is_err());
    }
}
