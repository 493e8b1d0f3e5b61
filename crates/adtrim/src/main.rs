//! Daemon entry point: configuration, wiring, and lifecycle.

mod ca_server;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adtrim_dns::{DnsResolver, DnsResolverConfig, DnsServerError};
use adtrim_filter::{EndpointRule, ResponseFilter};
use adtrim_proxy::{HttpsProxy, HttpsProxyConfig, ProxyError, UpstreamClientConfig};
use adtrim_tls::{CertAuthority, CertAuthorityConfig, TlsSetupError};
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError};

#[derive(Parser)]
#[command(name = "adtrim")]
#[command(about = "Ad-stripping intercept proxy and filtering DNS resolver", long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("certificate error: {0}")]
    Tls(#[from] TlsSetupError),
    #[error("dns server error: {0}")]
    Dns(#[from] DnsServerError),
    #[error("proxy server error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("ca server error: {0}")]
    CaServer(#[source] std::io::Error),
    #[error("signal handler error: {0}")]
    Signals(#[source] std::io::Error),
    #[error("{task} task panicked: {detail}")]
    TaskPanic { task: &'static str, detail: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(error) = run(args).await {
        tracing::error!(%error, "fatal startup error");
        eprintln!("adtrim: {error}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), StartupError> {
    let config = Config::load(&args.config)?;

    let authority = CertAuthority::load_or_generate(&CertAuthorityConfig {
        ca_cert_path: config.proxy.ca_cert.clone(),
        ca_key_path: config.proxy.ca_key.clone(),
        leaf_cert_path: config.proxy.server_cert.clone(),
        leaf_key_path: config.proxy.server_key.clone(),
        intercept_hosts: config.dns.intercept_hosts.clone(),
        server_ips: config.proxy.server_ips.clone(),
        ca_common_name: "adtrim Root CA".to_string(),
        ca_organization: "adtrim".to_string(),
    })?;

    let filter = Arc::new(ResponseFilter::new(
        config
            .filter
            .endpoints
            .iter()
            .map(|endpoint| {
                EndpointRule::new(endpoint.path.clone(), endpoint.remove_keys.iter().cloned())
            })
            .collect(),
    ));

    let resolver = DnsResolver::new(DnsResolverConfig {
        listen: config.dns.listen,
        upstream: config.dns.upstream,
        intercept_hosts: config.dns.intercept_hosts.clone(),
        intercept_ip: config.dns.intercept_ip,
        blocklist_paths: config
            .dns
            .blocklists
            .iter()
            .map(|entry| entry.path.clone())
            .collect(),
        blocklist_urls: config.dns.blocklist_urls.clone(),
        min_cache_ttl: Duration::from_secs(config.dns.min_cache_ttl),
        max_cache_ttl: Duration::from_secs(config.dns.max_cache_ttl),
    })
    .await?;

    let proxy = HttpsProxy::new(
        HttpsProxyConfig {
            listen: config.proxy.listen,
            upstream_host: config.proxy.upstream_host.clone(),
            upstream_allowlist: config.proxy.upstream_allowlist.clone(),
            upstream_client: UpstreamClientConfig::default(),
        },
        authority.server_config(),
        Arc::clone(&filter),
    )?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut dns_task = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            resolver
                .run_until_shutdown(shutdown_rx)
                .await
                .map_err(StartupError::from)
        })
    };
    let mut proxy_task = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            proxy
                .run_until_shutdown(shutdown_rx)
                .await
                .map_err(StartupError::from)
        })
    };
    let mut ca_task = {
        let ca_config = config.ca_server.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            match ca_config {
                Some(section) => {
                    ca_server::run_until_shutdown(section.listen, section.cert_path, shutdown_rx)
                        .await
                        .map_err(StartupError::CaServer)
                }
                None => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        })
    };

    tokio::select! {
        result = &mut dns_task => return flatten_task("dns resolver", result),
        result = &mut proxy_task => return flatten_task("https proxy", result),
        result = &mut ca_task => return flatten_task("ca server", result),
        signal = shutdown_signal() => {
            signal.map_err(StartupError::Signals)?;
            tracing::info!("shutdown signal received, stopping listeners");
            let _ = shutdown_tx.send(true);
        }
    }

    let _ = tokio::join!(dns_task, proxy_task, ca_task);
    Ok(())
}

fn flatten_task(
    task: &'static str,
    result: Result<Result<(), StartupError>, tokio::task::JoinError>,
) -> Result<(), StartupError> {
    match result {
        Ok(inner) => inner,
        Err(join_error) => Err(StartupError::TaskPanic {
            task,
            detail: join_error.to_string(),
        }),
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
