//! TLS-terminating reverse proxy.
//!
//! Terminates client TLS with the certificate authority's leaf, speaks
//! HTTP/1.1 toward clients, and forwards to an allow-listed HTTPS upstream
//! through a shared pooled client that negotiates HTTP/2 when offered.
//! Responses for filtered paths are buffered, decompressed, and rewritten;
//! everything else streams through.

mod body;
mod head;
mod host;
mod server;
mod upstream;

pub use host::{normalize_host, UpstreamAllowlist};
pub use server::{HttpsProxy, HttpsProxyConfig};
pub use upstream::{build_upstream_client, UpstreamClientConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream client build failed: {0}")]
    UpstreamClient(#[from] reqwest::Error),
    #[error("invalid proxy configuration: {0}")]
    InvalidConfig(String),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}
