//! The shared upstream HTTPS client.
//!
//! Resolution goes through a fixed external resolver rather than the system
//! configuration: pointing the host at our own DNS resolver would intercept
//! the upstream hostnames right back to this proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::ProxyError;

const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_READ_TIMEOUT: Duration = Duration::from_secs(15);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const POOL_MAX_IDLE_PER_HOST: usize = 50;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    /// External resolver used for upstream lookups.
    pub dns_server: SocketAddr,
    /// Additional trust anchors (PEM), for upstreams behind private CAs.
    pub extra_root_certificates: Vec<Vec<u8>>,
    /// Static host-to-address pins, bypassing resolution entirely.
    pub resolve_overrides: Vec<(String, SocketAddr)>,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            dns_server: SocketAddr::from(([8, 8, 8, 8], 53)),
            extra_root_certificates: Vec::new(),
            resolve_overrides: Vec::new(),
        }
    }
}

/// Build the shared pooled client: HTTP/2 when the upstream offers it,
/// redirects surfaced to the caller verbatim, every phase under a deadline.
pub fn build_upstream_client(
    config: &UpstreamClientConfig,
) -> Result<reqwest::Client, ProxyError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(RESPONSE_READ_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .dns_resolver(Arc::new(FixedDnsResolver::new(config.dns_server)));

    for pem in &config.extra_root_certificates {
        let certificate = reqwest::Certificate::from_pem(pem)?;
        builder = builder.add_root_certificate(certificate);
    }
    for (host, addr) in &config.resolve_overrides {
        builder = builder.resolve(host, *addr);
    }

    builder.build().map_err(ProxyError::UpstreamClient)
}

/// `reqwest` resolver backed by hickory against one fixed nameserver.
#[derive(Clone)]
struct FixedDnsResolver {
    inner: Arc<TokioAsyncResolver>,
}

impl FixedDnsResolver {
    fn new(dns_server: SocketAddr) -> Self {
        let nameservers =
            NameServerConfigGroup::from_ips_clear(&[dns_server.ip()], dns_server.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), nameservers);
        let mut opts = ResolverOpts::default();
        opts.timeout = DNS_LOOKUP_TIMEOUT;
        Self {
            inner: Arc::new(TokioAsyncResolver::tokio(config, opts)),
        }
    }
}

impl Resolve for FixedDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = Arc::clone(&self.inner);
        Box::pin(async move {
            let lookup = resolver.lookup_ip(name.as_str()).await?;
            let addrs: Addrs = Box::new(lookup.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
