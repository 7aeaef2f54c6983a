//! Response cache (spec section 4.3): a fingerprinted, size-bounded LRU
//! over full response replays, simplified from the teacher's multi-tier
//! `database::cache` design down to the single `moka` tier this crate
//! actually needs.

use moka::sync::Cache as MokaCache;
use std::time::Duration;
use uuid::Uuid;

use crate::model::CachedResponse;

/// The inputs to [`fingerprint`]. Deliberately excludes anything
/// auth-bearing — the cache key must never let one token's cached
/// response leak cross-token within the same project scope is exactly
/// the point, not a leak.
pub struct CacheKeyParts<'a> {
    /// Request method, as received.
    pub method: &'a str,
    /// Canonicalized request path (no trailing slash collapsing beyond
    /// what the router already normalizes).
    pub path: &'a str,
    /// Query pairs sorted by key, then value.
    pub sorted_query: &'a [(String, String)],
    /// A digest of the request body (e.g. BLAKE3 of the raw bytes),
    /// precomputed by the caller so this function stays allocation-light.
    pub body_digest: &'a [u8],
    /// Values of the configured Vary headers, in configured order.
    pub vary_values: &'a [Option<String>],
    /// The authenticated project — the cache's tenancy boundary.
    pub project_id: Uuid,
}

/// Compute the 32-byte fingerprint identifying a cacheable request.
pub fn fingerprint(parts: &CacheKeyParts<'_>) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parts.method.as_bytes());
    hasher.update(b"\0");
    hasher.update(parts.path.as_bytes());
    hasher.update(b"\0");
    for (key, value) in parts.sorted_query {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    hasher.update(b"\0");
    hasher.update(parts.body_digest);
    hasher.update(b"\0");
    for value in parts.vary_values {
        hasher.update(value.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(parts.project_id.as_bytes());
    *hasher.finalize().as_bytes()
}

/// A fingerprinted response cache.
pub struct ResponseCache {
    cache: MokaCache<[u8; 32], CachedResponse>,
    default_ttl: Duration,
}

impl ResponseCache {
    /// Build a cache bounded by entry count (moka approximates a byte
    /// budget via `weigher`; this crate uses the simpler entry-count cap
    /// plus a per-entry size check at insert time).
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .time_to_live(default_ttl)
            .build();
        Self { cache, default_ttl }
    }

    /// Look up a still-fresh entry.
    pub fn get(&self, fingerprint: &[u8; 32]) -> Option<CachedResponse> {
        let entry = self.cache.get(fingerprint)?;
        if entry.is_fresh(chrono::Utc::now()) {
            Some(entry)
        } else {
            self.cache.invalidate(fingerprint);
            None
        }
    }

    /// Store a response, subject to the cacheability rules: 2xx status,
    /// no `Cache-Control: no-store`, and under `max_entry_bytes`.
    pub fn put(&self, fingerprint: [u8; 32], response: CachedResponse, max_entry_bytes: usize) {
        if !(200..300).contains(&response.status) {
            return;
        }
        if response.body.len() > max_entry_bytes {
            return;
        }
        if response
            .headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("cache-control") && value.to_ascii_lowercase().contains("no-store"))
        {
            return;
        }
        self.cache.insert(fingerprint, response);
    }

    /// TTL applied when upstream supplied no `Cache-Control: max-age`.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

/// Parse a `max-age` value out of a `Cache-Control` header, if present.
pub fn max_age_from_cache_control(value: &str) -> Option<Duration> {
    value.split(',').find_map(|directive| {
        let directive = directive.trim();
        let seconds = directive.strip_prefix("max-age=")?;
        seconds.parse::<u64>().ok().map(Duration::from_secs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(status: u16, body: Vec<u8>, headers: Vec<(String, String)>) -> CachedResponse {
        let now = Utc::now();
        CachedResponse {
            status,
            headers,
            body,
            cached_at: now,
            expires_at: now + chrono::Duration::seconds(60),
        }
    }

    #[test]
    fn fingerprints_never_depend_on_request_order_of_construction_but_do_depend_on_content() {
        let project_id = Uuid::now_v7();
        let parts_a = CacheKeyParts {
            method: "POST",
            path: "/v1/chat/completions",
            sorted_query: &[],
            body_digest: b"digest-a",
            vary_values: &[Some("application/json".to_string())],
            project_id,
        };
        let parts_b = CacheKeyParts {
            body_digest: b"digest-b",
            ..parts_a
        };
        assert_ne!(fingerprint(&parts_a), fingerprint(&parts_b));
    }

    #[test]
    fn non_2xx_responses_are_never_cached() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let fp = [0u8; 32];
        cache.put(fp, sample(500, vec![1, 2, 3], Vec::new()), 1024);
        assert!(cache.get(&fp).is_none());
    }

    #[test]
    fn no_store_responses_are_never_cached() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let fp = [1u8; 32];
        cache.put(
            fp,
            sample(200, vec![1, 2, 3], vec![("Cache-Control".to_string(), "no-store".to_string())]),
            1024,
        );
        assert!(cache.get(&fp).is_none());
    }

    #[test]
    fn oversized_responses_are_never_cached() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let fp = [2u8; 32];
        cache.put(fp, sample(200, vec![0u8; 100], Vec::new()), 10);
        assert!(cache.get(&fp).is_none());
    }

    #[test]
    fn a_cacheable_response_round_trips() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let fp = [3u8; 32];
        cache.put(fp, sample(200, vec![9, 9, 9], Vec::new()), 1024);
        let hit = cache.get(&fp).expect("should be cached");
        assert_eq!(hit.body, vec![9, 9, 9]);
    }

    #[test]
    fn max_age_parses_out_of_a_composite_cache_control_header() {
        assert_eq!(
            max_age_from_cache_control("public, max-age=120, immutable"),
            Some(Duration::from_secs(120))
        );
        assert_eq!(max_age_from_cache_control("no-store"), None);
    }
}
