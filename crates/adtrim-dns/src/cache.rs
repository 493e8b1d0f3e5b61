//! TTL-bounded cache for upstream DNS responses.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;

/// Hard cap on cached entries; crossing it triggers eviction on insert.
const CACHE_CAPACITY: usize = 50_000;

struct CacheEntry {
    message: Message,
    expires_at: Instant,
}

/// Response cache keyed by the whole question section.
///
/// Lookups take the read lock; insertion and the rare eviction sweep take the
/// write lock. No lock is ever held across an await point.
pub struct DnsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    min_ttl: Duration,
    max_ttl: Duration,
}

impl DnsCache {
    pub fn new(min_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            min_ttl,
            max_ttl,
        }
    }

    /// A non-expired cached response, or nothing.
    pub fn lookup(&self, key: &str) -> Option<Message> {
        let entries = self.entries.read().expect("dns cache lock poisoned");
        let entry = entries.get(key)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.message.clone())
    }

    /// Cache a response under `key` for the clamped minimum answer TTL.
    pub fn store(&self, key: String, message: Message) {
        let ttl = self.cache_ttl(&message);
        let mut entries = self.entries.write().expect("dns cache lock poisoned");

        if entries.len() >= CACHE_CAPACITY {
            let now = Instant::now();
            entries.retain(|_, entry| now <= entry.expires_at);
            if entries.len() >= CACHE_CAPACITY {
                entries.clear();
            }
        }

        entries.insert(
            key,
            CacheEntry {
                message,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("dns cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Minimum positive answer TTL, clamped to `[min_ttl, max_ttl]`.
    fn cache_ttl(&self, message: &Message) -> Duration {
        let mut ttl = self.max_ttl;
        for record in message.answers() {
            if record.ttl() > 0 {
                let record_ttl = Duration::from_secs(u64::from(record.ttl()));
                if record_ttl < ttl {
                    ttl = record_ttl;
                }
            }
        }
        ttl.clamp(self.min_ttl, self.max_ttl)
    }
}
