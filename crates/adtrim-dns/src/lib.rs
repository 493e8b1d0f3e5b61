//! Forwarding DNS resolver with hostname interception and ad blocking.
//!
//! Queries for configured intercept hosts are answered with a local address
//! so the HTTPS proxy terminates their TLS. Names on the blocklist (and all
//! their subdomains) get NXDOMAIN. Everything else is forwarded to the
//! upstream resolver and cached under a TTL bound.

mod blocklist;
mod cache;
mod resolver;

pub use blocklist::{parse_blocklist_line, Blocklist, BlocklistSources};
pub use cache::DnsCache;
pub use resolver::{DnsResolver, DnsResolverConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsServerError {
    #[error("failed to bind DNS listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("blocklist HTTP client build failed: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}
