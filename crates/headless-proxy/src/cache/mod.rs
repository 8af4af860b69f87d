//! Response cache for rendered GET responses.
//!
//! Entries are keyed by a SHA-256 fingerprint of the request's method, path,
//! raw query, allow-listed forwarded headers and (when cookie forwarding is on)
//! its cookies. Only headers on the forward allow-list vary the key; an
//! unlisted header such as `Accept` never does.

use crate::proxy::RenderRequest;
use bytes::Bytes;
use hyper::header::{HeaderMap, CACHE_CONTROL};
use hyper::Method;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Population above which an insert triggers a sweep of expired entries.
pub const SWEEP_THRESHOLD: usize = 1000;

/// Stored response payload.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters for cache performance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub expirations: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct ResponseCache {
    ttl: Duration,
    forward_headers: Vec<String>,
    forward_cookies: bool,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    /// A zero `ttl` disables the cache.
    pub fn new(ttl: Duration, forward_headers: Vec<String>, forward_cookies: bool) -> Self {
        debug!(
            "Creating response cache: enabled={}, ttl={}s, forward_cookies={}",
            !ttl.is_zero(),
            ttl.as_secs(),
            forward_cookies
        );
        Self {
            ttl,
            forward_headers,
            forward_cookies,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Deterministic hex fingerprint of the request.
    pub fn fingerprint(&self, req: &RenderRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(req.method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(req.path.as_bytes());
        hasher.update(b"\n");
        hasher.update(req.query.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\n");

        for name in &self.forward_headers {
            if let Some(value) = req.header(name) {
                hasher.update(name.to_ascii_lowercase().as_bytes());
                hasher.update(b":");
                hasher.update(value.as_bytes());
                hasher.update(b"\n");
            }
        }

        if self.forward_cookies {
            let mut cookies: Vec<&(String, String)> = req.cookies.iter().collect();
            cookies.sort();
            for (name, value) in cookies {
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
                hasher.update(b"\n");
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Return the live entry for a GET request, deleting it if it has expired.
    pub fn lookup(&self, req: &RenderRequest) -> Option<CachedResponse> {
        if !self.is_enabled() || req.method != Method::GET {
            return None;
        }

        let key = self.fingerprint(req);
        let now = Instant::now();

        let expired = {
            let entries = self.entries.read();
            match entries.get(&key) {
                Some(entry) if !entry.is_expired(now) => {
                    trace!("Cache hit for key: {}", key);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.response.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write();
            // Re-check: a concurrent store may have refreshed the entry.
            if entries.get(&key).is_some_and(|e| e.is_expired(now)) {
                entries.remove(&key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                trace!("Cache entry expired for key: {}", key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response. Returns whether an entry was written.
    pub fn store(
        &self,
        req: &RenderRequest,
        body: &Bytes,
        headers: &HeaderMap,
        status: u16,
    ) -> bool {
        if !self.is_enabled() || req.method != Method::GET || !(200..300).contains(&status) {
            return false;
        }
        if forbids_storage(headers) {
            trace!("Skipping cache store for {}: cache-control forbids it", req.path);
            return false;
        }

        let key = self.fingerprint(req);
        let entry = CacheEntry {
            response: CachedResponse {
                status,
                headers: headers.clone(),
                body: body.clone(),
            },
            expires_at: Instant::now() + self.ttl,
        };

        let population = {
            let mut entries = self.entries.write();
            entries.insert(key, entry);
            entries.len()
        };
        self.inserts.fetch_add(1, Ordering::Relaxed);

        if population > SWEEP_THRESHOLD {
            self.sweep_expired();
        }
        true
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        debug!("Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }
}

fn forbids_storage(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| {
            let v = v.to_ascii_lowercase();
            v.contains("no-store") || v.contains("no-cache")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn cache(ttl_secs: u64) -> ResponseCache {
        ResponseCache::new(
            Duration::from_secs(ttl_secs),
            vec!["Accept-Language".to_string(), "User-Agent".to_string()],
            false,
        )
    }

    fn get(path: &str) -> RenderRequest {
        RenderRequest::new(Method::GET, path, "test")
    }

    fn html_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html; charset=utf-8"));
        headers
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_then_lookup() {
        let cache = cache(60);
        let req = get("/page");

        assert!(cache.lookup(&req).is_none());
        assert!(cache.store(&req, &Bytes::from("<p>hi</p>"), &html_headers(), 200));

        let hit = cache.lookup(&req).unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from("<p>hi</p>"));
        assert_eq!(
            hit.headers.get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.size, 1);
        assert!((cache.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = cache(60);
        let req = get("/page");
        cache.store(&req, &Bytes::from("a"), &html_headers(), 200);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.lookup(&req).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.lookup(&req).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_stores() {
        let cache = cache(0);
        let req = get("/page");
        assert!(!cache.is_enabled());
        assert!(!cache.store(&req, &Bytes::from("a"), &html_headers(), 200));
        assert!(cache.lookup(&req).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_only_get_is_cached() {
        let cache = cache(60);
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            let req = RenderRequest::new(method, "/write", "test");
            assert!(!cache.store(&req, &Bytes::from("x"), &html_headers(), 200));
            assert!(cache.lookup(&req).is_none());
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_non_2xx_not_stored() {
        let cache = cache(60);
        let req = get("/missing");
        assert!(!cache.store(&req, &Bytes::from("x"), &html_headers(), 404));
        assert!(!cache.store(&req, &Bytes::from("x"), &html_headers(), 301));
        assert!(cache.store(&req, &Bytes::from("x"), &html_headers(), 204));
    }

    #[tokio::test]
    async fn test_cache_control_honored() {
        let cache = cache(60);
        let req = get("/private");

        let mut headers = html_headers();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, No-Store"));
        assert!(!cache.store(&req, &Bytes::from("x"), &headers, 200));

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        assert!(!cache.store(&req, &Bytes::from("x"), &headers, 200));

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        assert!(cache.store(&req, &Bytes::from("x"), &headers, 200));
    }

    #[tokio::test]
    async fn test_store_overwrites() {
        let cache = cache(60);
        let req = get("/page");
        cache.store(&req, &Bytes::from("old"), &html_headers(), 200);
        cache.store(&req, &Bytes::from("new"), &html_headers(), 200);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&req).unwrap().body, Bytes::from("new"));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let cache = cache(60);
        let a = get("/p?x=1").with_header("accept-language", "en");
        let b = get("/p?x=1").with_header("accept-language", "en");
        assert_eq!(cache.fingerprint(&a), cache.fingerprint(&b));
        assert_eq!(cache.fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_varies_by_listed_headers_only() {
        let cache = cache(60);
        let base = get("/p");
        let lang = get("/p").with_header("accept-language", "de");
        let accept = get("/p").with_header("accept", "application/json");

        assert_ne!(cache.fingerprint(&base), cache.fingerprint(&lang));
        assert_eq!(cache.fingerprint(&base), cache.fingerprint(&accept));
    }

    #[test]
    fn test_fingerprint_varies_by_query_and_method() {
        let cache = cache(60);
        assert_ne!(
            cache.fingerprint(&get("/p?a=1")),
            cache.fingerprint(&get("/p?a=2"))
        );
        assert_ne!(
            cache.fingerprint(&get("/p")),
            cache.fingerprint(&RenderRequest::new(Method::POST, "/p", "t"))
        );
    }

    #[test]
    fn test_fingerprint_cookies_only_when_forwarded() {
        let without = cache(60);
        let with = ResponseCache::new(Duration::from_secs(60), vec![], true);

        let a = get("/p").with_header("cookie", "b=2; a=1");
        let b = get("/p").with_header("cookie", "a=1; b=2");
        let c = get("/p").with_header("cookie", "a=9");

        assert_eq!(without.fingerprint(&a), without.fingerprint(&c));
        assert_eq!(with.fingerprint(&a), with.fingerprint(&b));
        assert_ne!(with.fingerprint(&a), with.fingerprint(&c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_after_threshold() {
        let cache = ResponseCache::new(Duration::from_secs(10), vec![], false);
        for i in 0..SWEEP_THRESHOLD {
            cache.store(&get(&format!("/old/{i}")), &Bytes::from("x"), &html_headers(), 200);
        }
        assert_eq!(cache.len(), SWEEP_THRESHOLD);

        tokio::time::advance(Duration::from_secs(11)).await;
        cache.store(&get("/fresh"), &Bytes::from("x"), &html_headers(), 200);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, SWEEP_THRESHOLD as u64);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache(60);
        cache.store(&get("/a"), &Bytes::from("x"), &html_headers(), 200);
        cache.clear();
        assert!(cache.is_empty());
    }
}
