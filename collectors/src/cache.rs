// TODO! Fold auth-relevant request headers into the cache key; two calls
// differing only in Accept or Authorization currently share one entry.

//! HTTP response cache shared by every script's `request` and `scrape`
//! capabilities. Keyed on URL + request body; the lifetime comes from the
//! owning source's configuration entry. Racing writers for one key are
//! harmless, the inserts are idempotent.

use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;

/// Default lifetime when a source has no TTL configured: 24 hours.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bound on distinct cached responses.
const CACHE_CAPACITY: u64 = 16 * 1024;

#[derive(Clone)]
struct CachedResponse {
    body: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedResponse> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// The response cache.
pub struct ResponseCache {
    entries: Cache<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    /// Cache key for one request: the URL and the request body.
    /// Headers deliberately do not participate.
    pub fn key(url: &str, body: &str) -> String {
        format!("{}\u{1}{}", url, body)
    }

    pub fn get(&self, url: &str, body: &str) -> Option<String> {
        self.entries
            .get(&Self::key(url, body))
            .map(|entry| entry.body)
    }

    /// Store a successful response body with the source's TTL in minutes.
    pub fn put(&self, url: &str, body: &str, response: String, ttl_minutes: Option<u64>) {
        let ttl = ttl_minutes
            .map(|minutes| Duration::from_secs(minutes * 60))
            .unwrap_or(DEFAULT_TTL);
        self.entries.insert(
            Self::key(url, body),
            CachedResponse {
                body: response,
                ttl,
            },
        );
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_come_back_and_bodies_key_separately() {
        let cache = ResponseCache::new();
        cache.put("https://api.example.com/q", "", "first".to_string(), Some(60));
        cache.put(
            "https://api.example.com/q",
            "page=2",
            "second".to_string(),
            Some(60),
        );

        assert_eq!(
            cache.get("https://api.example.com/q", "").as_deref(),
            Some("first")
        );
        assert_eq!(
            cache.get("https://api.example.com/q", "page=2").as_deref(),
            Some("second")
        );
        assert!(cache.get("https://api.example.com/other", "").is_none());
    }

    #[test]
    fn racing_inserts_settle_on_one_body() {
        let cache = ResponseCache::new();
        cache.put("u", "b", "one".to_string(), Some(5));
        cache.put("u", "b", "two".to_string(), Some(5));
        // Last writer wins; either way a single coherent body remains.
        assert_eq!(cache.get("u", "b").as_deref(), Some("two"));
    }
}
