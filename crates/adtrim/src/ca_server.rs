//! Plain-HTTP endpoint serving the Root CA certificate for device install.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const REQUEST_DEADLINE: Duration = Duration::from_secs(10);
const MAX_HEAD_BYTES: usize = 8 * 1024;

const INDEX_PAGE: &str = r#"<html><body>
<h2>adtrim &mdash; Root CA</h2>
<p>Download and install the Root CA certificate on your devices:</p>
<a href="/ca.crt">Download ca.crt</a>
<hr>
<h3>Installation instructions:</h3>
<ul>
<li><b>iOS:</b> Open the link on your iPhone, then Settings, Profile Downloaded, Install, Trust</li>
<li><b>Android:</b> Download, then Settings, Security, Install certificate, CA certificate</li>
<li><b>Windows:</b> Download, double-click, Install, place in Trusted Root CAs</li>
</ul>
</body></html>"#;

pub async fn run(listen: SocketAddr, cert_path: PathBuf) -> io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    serve_with(listener, cert_path).await
}

pub async fn run_until_shutdown(
    listen: SocketAddr,
    cert_path: PathBuf,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> io::Result<()> {
    adtrim_support::serve_until_shutdown(run(listen, cert_path), shutdown_rx).await
}

pub async fn serve_with(listener: TcpListener, cert_path: PathBuf) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(listen = %addr, "ca download endpoint listening");
    }
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%error, "ca server accept failed");
                continue;
            }
        };
        let cert_path = cert_path.clone();
        tokio::spawn(async move {
            let handled = tokio::time::timeout(REQUEST_DEADLINE, handle(stream, cert_path)).await;
            match handled {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::debug!(%error, %peer, "ca request failed"),
                Err(_) => tracing::debug!(%peer, "ca request timed out"),
            }
        });
    }
}

async fn handle(mut stream: TcpStream, cert_path: PathBuf) -> io::Result<()> {
    let mut head = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        if head.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head exceeded limit",
            ));
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        head.extend_from_slice(&chunk[..read]);
    }

    let text = String::from_utf8_lossy(&head);
    let path = text
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();

    match path.as_str() {
        "/ca.crt" => match tokio::fs::read(&cert_path).await {
            Ok(pem) => {
                write_response(
                    &mut stream,
                    "200 OK",
                    &[
                        ("content-type", "application/x-x509-ca-cert"),
                        (
                            "content-disposition",
                            "attachment; filename=adtrim-ca.crt",
                        ),
                    ],
                    &pem,
                )
                .await
            }
            Err(error) => {
                tracing::warn!(path = %cert_path.display(), %error, "ca certificate unreadable");
                write_response(&mut stream, "404 Not Found", &[], b"not found\n").await
            }
        },
        "/" => {
            write_response(
                &mut stream,
                "200 OK",
                &[("content-type", "text/html; charset=utf-8")],
                INDEX_PAGE.as_bytes(),
            )
            .await
        }
        _ => write_response(&mut stream, "404 Not Found", &[], b"not found\n").await,
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!(
        "content-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    ));
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await
}
