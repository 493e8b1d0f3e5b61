//! Host normalization and the upstream allowlist.

use std::collections::HashSet;

/// Lowercase, trim, and strip any `:port` suffix and trailing dot.
///
/// Returns an empty string for inputs that normalize away entirely.
pub fn normalize_host(host: &str) -> String {
    let mut host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return host;
    }

    // Bracketed IPv6 literals keep their address but lose the port.
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }

    // A single colon separates host from port; more than one means a bare
    // IPv6 literal, which is left intact.
    if host.bytes().filter(|byte| *byte == b':').count() == 1 {
        if let Some(index) = host.rfind(':') {
            if index > 0 {
                host.truncate(index);
            }
        }
    }

    host.trim_end_matches('.').to_string()
}

/// The set of hosts the proxy may forward to; always contains the default.
#[derive(Debug, Clone)]
pub struct UpstreamAllowlist {
    default_host: String,
    allowed: HashSet<String>,
}

impl UpstreamAllowlist {
    pub fn new(default_upstream: &str, extra: &[String]) -> Self {
        let default_host = normalize_host(default_upstream);
        let mut allowed = HashSet::new();
        if !default_host.is_empty() {
            allowed.insert(default_host.clone());
        }
        for host in extra {
            let normalized = normalize_host(host);
            if !normalized.is_empty() {
                allowed.insert(normalized);
            }
        }
        Self {
            default_host,
            allowed,
        }
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    pub fn contains(&self, normalized_host: &str) -> bool {
        self.allowed.contains(normalized_host)
    }

    /// Pick the forwarding target for a request `Host` header.
    ///
    /// Allow-listed hosts are honoured; anything else falls back to the
    /// default upstream so the proxy cannot be used as an open relay.
    pub fn select_target(&self, requested_host: Option<&str>) -> (String, bool) {
        let requested = requested_host.map(normalize_host).unwrap_or_default();
        if !requested.is_empty() && self.allowed.contains(&requested) {
            (requested, false)
        } else {
            let substituted = !requested.is_empty() && requested != self.default_host;
            (self.default_host.clone(), substituted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_port_case_and_trailing_dot() {
        assert_eq!(normalize_host("API.Example.COM:443"), "api.example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("  example.com  "), "example.com");
        assert_eq!(normalize_host(""), "");
    }

    #[test]
    fn normalize_handles_ipv6_literals() {
        assert_eq!(normalize_host("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(normalize_host("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn allowlist_always_contains_default() {
        let allowlist = UpstreamAllowlist::new("api.example.com:443", &[]);
        assert!(allowlist.contains("api.example.com"));
        assert_eq!(allowlist.default_host(), "api.example.com");
    }

    #[test]
    fn select_target_honours_allowlisted_hosts() {
        let allowlist =
            UpstreamAllowlist::new("api.example.com", &["cdn.example.com.".to_string()]);

        assert_eq!(
            allowlist.select_target(Some("CDN.example.com:443")),
            ("cdn.example.com".to_string(), false)
        );
    }

    #[test]
    fn select_target_falls_back_for_unknown_hosts() {
        let allowlist = UpstreamAllowlist::new("api.example.com", &[]);

        assert_eq!(
            allowlist.select_target(Some("evil.example")),
            ("api.example.com".to_string(), true)
        );
        assert_eq!(
            allowlist.select_target(None),
            ("api.example.com".to_string(), false)
        );
    }
}
