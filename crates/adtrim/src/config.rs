//! YAML configuration loading and validation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MIN_CACHE_TTL_SECS: u64 = 120;
pub const DEFAULT_MAX_CACHE_TTL_SECS: u64 = 15 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub dns: DnsSection,
    pub proxy: ProxySection,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub ca_server: Option<CaServerSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSection {
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
    pub intercept_hosts: Vec<String>,
    #[serde(default = "default_intercept_ip")]
    pub intercept_ip: Ipv4Addr,
    #[serde(default)]
    pub blocklists: Vec<BlocklistEntry>,
    #[serde(default)]
    pub blocklist_urls: Vec<String>,
    /// Cache TTL ceiling in seconds.
    #[serde(default = "default_max_cache_ttl")]
    pub max_cache_ttl: u64,
    /// Cache TTL floor in seconds.
    #[serde(default = "default_min_cache_ttl")]
    pub min_cache_ttl: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlocklistEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    pub listen: SocketAddr,
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub upstream_host: String,
    #[serde(default)]
    pub upstream_allowlist: Vec<String>,
    #[serde(default)]
    pub server_ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSection {
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointEntry {
    pub path: String,
    #[serde(default)]
    pub remove_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaServerSection {
    pub listen: SocketAddr,
    pub cert_path: PathBuf,
}

fn default_intercept_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_max_cache_ttl() -> u64 {
    DEFAULT_MAX_CACHE_TTL_SECS
}

fn default_min_cache_ttl() -> u64 {
    DEFAULT_MIN_CACHE_TTL_SECS
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dns.intercept_hosts.is_empty() {
            return Err(ConfigError::Invalid(
                "dns.intercept_hosts must name at least one host".to_string(),
            ));
        }
        if self.dns.min_cache_ttl > self.dns.max_cache_ttl {
            return Err(ConfigError::Invalid(
                "dns.min_cache_ttl must not exceed dns.max_cache_ttl".to_string(),
            ));
        }
        if self.proxy.upstream_host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "proxy.upstream_host must not be empty".to_string(),
            ));
        }
        for endpoint in &self.filter.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "filter endpoint path {:?} must start with '/'",
                    endpoint.path
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
dns:
  listen: "0.0.0.0:53"
  upstream: "1.1.1.1:53"
  intercept_hosts:
    - youtubei.googleapis.com
  intercept_ip: "10.0.0.5"
  blocklists:
    - path: /etc/adtrim/ads.txt
      comment: local list
  blocklist_urls:
    - https://lists.example.com/hosts.txt
  max_cache_ttl: 600

proxy:
  listen: "0.0.0.0:443"
  ca_cert: /var/lib/adtrim/ca.crt
  ca_key: /var/lib/adtrim/ca.key
  server_cert: /var/lib/adtrim/server.crt
  server_key: /var/lib/adtrim/server.key
  upstream_host: "youtubei.googleapis.com"
  upstream_allowlist:
    - www.youtube.com
  server_ips:
    - "10.0.0.5"

filter:
  endpoints:
    - path: /youtubei/v1/player
      remove_keys: [adPlacements, playerAds]

ca_server:
  listen: "0.0.0.0:8080"
  cert_path: /var/lib/adtrim/ca.crt
"#;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn full_config_parses_with_defaults() {
        let config = parse(FULL_CONFIG).expect("parse");
        assert_eq!(config.dns.intercept_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(config.dns.max_cache_ttl, 600);
        assert_eq!(config.dns.min_cache_ttl, DEFAULT_MIN_CACHE_TTL_SECS);
        assert_eq!(config.filter.endpoints.len(), 1);
        assert_eq!(config.filter.endpoints[0].remove_keys.len(), 2);
        assert!(config.ca_server.is_some());
    }

    #[test]
    fn intercept_ip_defaults_to_loopback() {
        let text = FULL_CONFIG.replace("  intercept_ip: \"10.0.0.5\"\n", "");
        let config = parse(&text).expect("parse");
        assert_eq!(config.dns.intercept_ip, Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn empty_intercept_set_is_rejected() {
        let text = FULL_CONFIG.replace(
            "  intercept_hosts:\n    - youtubei.googleapis.com\n",
            "  intercept_hosts: []\n",
        );
        assert!(matches!(parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn filter_path_must_be_rooted() {
        let text = FULL_CONFIG.replace("path: /youtubei/v1/player", "path: youtubei/v1/player");
        assert!(matches!(parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_ttl_bounds_are_rejected() {
        let text = FULL_CONFIG.replace("max_cache_ttl: 600", "max_cache_ttl: 60\n  min_cache_ttl: 300");
        assert!(matches!(parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = FULL_CONFIG.replace("dns:", "dns:\n  typo_field: 1");
        assert!(matches!(parse(&text), Err(ConfigError::Parse(_))));
    }
}
