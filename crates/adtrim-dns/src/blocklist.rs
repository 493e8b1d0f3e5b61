//! Blocklist loading and lookup.
//!
//! Sources are hosts-format and adblock-format lists, read from local files
//! and HTTP(S) URLs. A failed source is logged and skipped; the remaining
//! sources still produce a usable set.

use std::collections::HashSet;
use std::path::PathBuf;

/// A deduplicated set of blocked FQDNs (lowercased, dot-terminated).
#[derive(Debug, Default)]
pub struct Blocklist {
    domains: HashSet<String>,
}

impl Blocklist {
    pub fn from_domains(domains: HashSet<String>) -> Self {
        Self { domains }
    }

    /// Suffix-match lookup: for `a.b.c.` tests `a.b.c.`, `b.c.`, `c.`.
    ///
    /// Expects a lowercased, dot-terminated name.
    pub fn is_blocked(&self, fqdn: &str) -> bool {
        let mut current = fqdn;
        loop {
            if self.domains.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(position) if position + 1 < current.len() => {
                    current = &current[position + 1..];
                }
                _ => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Extract a blocked domain from one list line.
///
/// Accepted shapes (after trimming; empty, `#`, and `!` lines are skipped):
/// `||domain^`, `0.0.0.0 domain`, `127.0.0.1 domain`, and bare `domain`
/// (which must contain a dot and no spaces). Lines containing `/` are
/// rejected so path-scoped adblock rules never block a whole domain.
pub fn parse_blocklist_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }

    let domain = if let Some(stripped) = line.strip_prefix("||") {
        stripped.strip_suffix('^')?
    } else if let Some(rest) = line
        .strip_prefix("0.0.0.0 ")
        .or_else(|| line.strip_prefix("127.0.0.1 "))
    {
        rest.split_whitespace().next()?
    } else if !line.contains(' ') && line.contains('.') {
        line
    } else {
        return None;
    };

    if domain.is_empty() || domain.contains('/') {
        return None;
    }
    Some(to_fqdn(domain))
}

fn to_fqdn(domain: &str) -> String {
    let mut name = domain.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// The configured file and URL sources a blocklist is rebuilt from.
#[derive(Debug, Clone, Default)]
pub struct BlocklistSources {
    pub paths: Vec<PathBuf>,
    pub urls: Vec<String>,
}

impl BlocklistSources {
    /// Build a fresh set from every reachable source.
    ///
    /// Individual source failures are non-fatal: logged and skipped.
    pub async fn load(&self, http: &reqwest::Client) -> Blocklist {
        let mut domains = HashSet::new();

        for path in &self.paths {
            match tokio::fs::read_to_string(path).await {
                Ok(text) => collect_lines(&text, &mut domains),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping blocklist file");
                }
            }
        }

        for url in &self.urls {
            match fetch_list(http, url).await {
                Ok(text) => collect_lines(&text, &mut domains),
                Err(error) => {
                    tracing::warn!(url, %error, "skipping blocklist URL");
                }
            }
        }

        Blocklist::from_domains(domains)
    }
}

async fn fetch_list(http: &reqwest::Client, url: &str) -> Result<String, reqwest::Error> {
    http.get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

fn collect_lines(text: &str, out: &mut HashSet<String>) {
    for line in text.lines() {
        if let Some(domain) = parse_blocklist_line(line) {
            out.insert(domain);
        }
    }
}
