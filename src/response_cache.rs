//! Response turbo-cache
//!
//! A small fixed array of cached GET responses keyed by `scheme|host|path`.
//! Meant to absorb bursts of identical requests for a few seconds, not to be
//! a general HTTP cache. Each controller owns one.

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode, Uri};
use std::time::{Duration, SystemTime};

pub const MAX_ENTRIES: usize = 8;
pub const MAX_KEY_LENGTH: usize = 256;
pub const MAX_HEADER_SIZE: usize = 4096;
pub const MAX_BODY_SIZE: usize = 32 * 1024;
/// Lifetime of responses that say nothing about their freshness
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(10);

const CACHEABLE_STATUSES: [u16; 10] = [200, 203, 204, 300, 301, 404, 405, 410, 414, 501];

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    status: StatusCode,
    header_blob: Vec<u8>,
    body: Bytes,
    /// Response date, used to pick the stalest entry on eviction
    date: SystemTime,
    expires_at: SystemTime,
}

impl Entry {
    fn decode_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let text = String::from_utf8_lossy(&self.header_blob);
        for line in text.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
        headers
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub fetches: u32,
    pub hits: u32,
    pub stores: u32,
    pub store_successes: u32,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.fetches == 0 {
            0.0
        } else {
            self.hits as f64 / self.fetches as f64
        }
    }

    pub fn store_success_ratio(&self) -> f64 {
        if self.stores == 0 {
            0.0
        } else {
            self.store_successes as f64 / self.stores as f64
        }
    }
}

/// Counters wrap to 1, keeping ratios meaningful after overflow
fn bump(counter: &mut u32) {
    *counter = counter.checked_add(1).unwrap_or(1);
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: Vec<Entry>,
    heuristic_floor: Duration,
    default_freshness: Duration,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(heuristic_floor: Duration) -> Self {
        Self {
            entries: Vec::with_capacity(MAX_ENTRIES),
            heuristic_floor,
            default_freshness: DEFAULT_FRESHNESS,
            stats: CacheStats::default(),
        }
    }

    pub fn set_heuristic_floor(&mut self, floor: Duration) {
        self.heuristic_floor = floor;
    }

    pub fn set_default_freshness(&mut self, freshness: Duration) {
        self.default_freshness = freshness;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache key for a request, or None if it would exceed the key size limit
    pub fn key_for(scheme: &str, host: &str, path: &str) -> Option<String> {
        let key = format!("{}|{}|{}", scheme, host.to_ascii_lowercase(), path);
        if key.len() > MAX_KEY_LENGTH {
            None
        } else {
            Some(key)
        }
    }

    pub fn request_allows_fetch(method: &Method, headers: &HeaderMap) -> bool {
        if method != Method::GET {
            return false;
        }
        let forbids = |name: &str| {
            headers.get_all(name).iter().any(|v| {
                let v = v.to_str().unwrap_or("").to_ascii_lowercase();
                v.contains("no-cache") || v.contains("no-store") || v.contains("max-age=0")
            })
        };
        !forbids("cache-control") && !forbids("pragma")
    }

    pub fn request_allows_store(method: &Method, headers: &HeaderMap) -> bool {
        method == Method::GET
            && !headers.contains_key(hyper::header::AUTHORIZATION)
            && !cache_control_has(headers, "no-store")
    }

    pub fn fetch(&mut self, key: &str, now: SystemTime) -> Option<CachedResponse> {
        bump(&mut self.stats.fetches);

        let index = self.entries.iter().position(|e| e.key == key)?;
        if self.entries[index].expires_at <= now {
            self.entries.swap_remove(index);
            return None;
        }

        bump(&mut self.stats.hits);
        let entry = &self.entries[index];
        Some(CachedResponse {
            status: entry.status,
            headers: entry.decode_headers(),
            body: entry.body.clone(),
        })
    }

    /// Whether a response can be stored, judging only by status and headers
    pub fn response_storable(status: StatusCode, headers: &HeaderMap) -> bool {
        CACHEABLE_STATUSES.contains(&status.as_u16())
            && !headers.contains_key(hyper::header::VARY)
            && !headers.contains_key(hyper::header::SET_COOKIE)
            && !cache_control_has(headers, "no-store")
            && !cache_control_has(headers, "no-cache")
            && !cache_control_has(headers, "private")
    }

    /// Store a complete response. Returns whether it was stored.
    pub fn store(
        &mut self,
        key: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
        now: SystemTime,
    ) -> bool {
        bump(&mut self.stats.stores);

        if key.len() > MAX_KEY_LENGTH
            || body.len() > MAX_BODY_SIZE
            || !Self::response_storable(status, headers)
        {
            return false;
        }

        let header_blob = encode_headers(headers);
        if header_blob.len() > MAX_HEADER_SIZE {
            return false;
        }

        let date = header_time(headers, hyper::header::DATE).unwrap_or(now);
        let Some(expires_at) = self.expiry(headers, date, now) else {
            return false;
        };
        if expires_at <= now {
            return false;
        }

        let entry = Entry {
            key: key.to_string(),
            status,
            header_blob,
            body,
            date,
            expires_at,
        };

        if let Some(existing) = self.entries.iter_mut().find(|e| e.key == key) {
            *existing = entry;
        } else if self.entries.len() < MAX_ENTRIES {
            self.entries.push(entry);
        } else if let Some(stalest) = self.entries.iter_mut().min_by_key(|e| e.date) {
            *stalest = entry;
        }

        bump(&mut self.stats.store_successes);
        true
    }

    /// Drop the entry for `key` and the entries that the response's
    /// Location and Content-Location headers point at on the same host
    pub fn invalidate(&mut self, key: &str, scheme: &str, host: &str, response_headers: &HeaderMap) {
        let mut keys = vec![key.to_string()];
        for name in [hyper::header::LOCATION, hyper::header::CONTENT_LOCATION] {
            let target = response_headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| location_key(v.trim(), scheme, host));
            keys.extend(target);
        }
        self.entries.retain(|e| !keys.contains(&e.key));
    }

    /// Expiry from max-age, then Expires, then the Last-Modified heuristic,
    /// then the default freshness
    fn expiry(&self, headers: &HeaderMap, date: SystemTime, now: SystemTime) -> Option<SystemTime> {
        if let Some(max_age) = cache_control_max_age(headers) {
            return Some(now + Duration::from_secs(max_age));
        }
        if headers.contains_key(hyper::header::EXPIRES) {
            // an unparseable Expires means already expired
            return header_time(headers, hyper::header::EXPIRES);
        }
        if headers.contains_key(hyper::header::LAST_MODIFIED) {
            let Some(last_modified) = header_time(headers, hyper::header::LAST_MODIFIED) else {
                return Some(now + Duration::from_secs(1));
            };
            if last_modified < date {
                let age = date.duration_since(last_modified).unwrap_or_default();
                return Some(now + (age / 10).max(self.heuristic_floor));
            }
        }
        Some(now + self.default_freshness)
    }
}

/// Cache key for a Location-style header value, if it names a path on `host`
fn location_key(value: &str, scheme: &str, host: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    if value.starts_with('/') {
        return ResponseCache::key_for(scheme, host, value);
    }
    let uri: Uri = value.parse().ok()?;
    if !uri.host()?.eq_ignore_ascii_case(host) {
        return None;
    }
    let scheme = uri.scheme_str().unwrap_or(scheme);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    ResponseCache::key_for(scheme, host, path)
}

fn cache_control_has(headers: &HeaderMap, directive: &str) -> bool {
    headers
        .get_all(hyper::header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|d| d.trim().eq_ignore_ascii_case(directive))
}

fn cache_control_max_age(headers: &HeaderMap) -> Option<u64> {
    let mut max_age = None;
    for value in headers
        .get_all(hyper::header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
    {
        for directive in value.split(',') {
            let Some((name, arg)) = directive.trim().split_once('=') else {
                continue;
            };
            let Ok(secs) = arg.trim().trim_matches('"').parse::<u64>() else {
                continue;
            };
            // s-maxage wins over max-age for a shared cache
            if name.eq_ignore_ascii_case("s-maxage") {
                return Some(secs);
            }
            if name.eq_ignore_ascii_case("max-age") {
                max_age = Some(secs);
            }
        }
    }
    max_age
}

fn header_time(headers: &HeaderMap, name: HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    let parsed = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let secs = parsed.timestamp();
    if secs < 0 {
        return Some(SystemTime::UNIX_EPOCH);
    }
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64))
}

fn encode_headers(headers: &HeaderMap) -> Vec<u8> {
    let mut blob = Vec::new();
    for (name, value) in headers {
        blob.extend_from_slice(name.as_str().as_bytes());
        blob.extend_from_slice(b": ");
        blob.extend_from_slice(value.as_bytes());
        blob.extend_from_slice(b"\r\n");
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn http_date(t: SystemTime) -> String {
        let dt: chrono::DateTime<chrono::Utc> = t.into();
        dt.to_rfc2822()
    }

    fn cache() -> ResponseCache {
        ResponseCache::new(Duration::from_secs(1))
    }

    #[test]
    fn test_store_then_hit() {
        let mut cache = cache();
        let now = SystemTime::now();
        let key = ResponseCache::key_for("http", "Example.com", "/foo").unwrap();
        assert_eq!(key, "http|example.com|/foo");

        let h = headers(&[("cache-control", "max-age=60, public"), ("content-type", "text/plain")]);
        assert!(cache.store(&key, StatusCode::OK, &h, Bytes::from_static(b"hello"), now));

        let hit = cache.fetch(&key, now + Duration::from_secs(30)).unwrap();
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.body, Bytes::from_static(b"hello"));
        assert_eq!(hit.headers.get("content-type").unwrap(), "text/plain");

        let stats = cache.stats();
        assert_eq!((stats.fetches, stats.hits, stats.stores, stats.store_successes), (1, 1, 1, 1));
    }

    #[test]
    fn test_expired_entry_misses() {
        let mut cache = cache();
        let now = SystemTime::now();
        let h = headers(&[("cache-control", "max-age=60")]);
        assert!(cache.store("k", StatusCode::OK, &h, Bytes::new(), now));
        assert!(cache.fetch("k", now + Duration::from_secs(61)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let mut cache = cache();
        let now = SystemTime::now();
        let h = headers(&[("cache-control", "max-age=60")]);
        cache.store("k", StatusCode::OK, &h, Bytes::new(), now);
        cache.invalidate("k", "http", "example.com", &HeaderMap::new());
        assert!(cache.fetch("k", now).is_none());
    }

    #[test]
    fn test_invalidate_follows_location_headers() {
        let mut cache = cache();
        let now = SystemTime::now();
        let h = headers(&[("cache-control", "max-age=60")]);
        for path in ["/posts/1", "/posts/2", "/feed", "/other"] {
            let key = ResponseCache::key_for("http", "example.com", path).unwrap();
            assert!(cache.store(&key, StatusCode::OK, &h, Bytes::new(), now));
        }
        let elsewhere = ResponseCache::key_for("http", "elsewhere.org", "/feed").unwrap();
        assert!(cache.store(&elsewhere, StatusCode::OK, &h, Bytes::new(), now));

        let post = ResponseCache::key_for("http", "example.com", "/posts").unwrap();
        let response = headers(&[
            ("location", "/posts/1"),
            ("content-location", "http://Example.com/posts/2"),
        ]);
        cache.invalidate(&post, "http", "example.com", &response);

        let key = |path: &str| ResponseCache::key_for("http", "example.com", path).unwrap();
        assert!(cache.fetch(&key("/posts/1"), now).is_none());
        assert!(cache.fetch(&key("/posts/2"), now).is_none());
        assert!(cache.fetch(&key("/feed"), now).is_some());

        // a location on another host leaves that host's entries alone
        let foreign = headers(&[("location", "http://elsewhere.org/feed")]);
        cache.invalidate(&post, "http", "example.com", &foreign);
        assert!(cache.fetch(&elsewhere, now).is_some());
        assert!(cache.fetch(&key("/other"), now).is_some());
    }

    #[test]
    fn test_location_key() {
        assert_eq!(location_key("/a?b=1", "https", "h.test").as_deref(), Some("https|h.test|/a?b=1"));
        assert_eq!(location_key("https://h.test/x", "http", "h.test").as_deref(), Some("https|h.test|/x"));
        assert_eq!(location_key("http://h.test", "http", "h.test").as_deref(), Some("http|h.test|/"));
        assert_eq!(location_key("http://other.test/x", "http", "h.test"), None);
        assert_eq!(location_key("relative/path", "http", "h.test"), None);
        assert_eq!(location_key("", "http", "h.test"), None);
    }

    #[test]
    fn test_not_storable() {
        let mut cache = cache();
        let now = SystemTime::now();
        let fresh = ("cache-control", "max-age=60");

        assert!(!cache.store("a", StatusCode::CREATED, &headers(&[fresh]), Bytes::new(), now));
        assert!(!cache.store("b", StatusCode::OK, &headers(&[fresh, ("vary", "accept")]), Bytes::new(), now));
        assert!(!cache.store("c", StatusCode::OK, &headers(&[("cache-control", "no-store")]), Bytes::new(), now));
        assert!(!cache.store("d", StatusCode::OK, &headers(&[("expires", "0")]), Bytes::new(), now));
        let big = Bytes::from(vec![b'x'; MAX_BODY_SIZE + 1]);
        assert!(!cache.store("e", StatusCode::OK, &headers(&[fresh]), big, now));
        let long_header = "v".repeat(MAX_HEADER_SIZE);
        assert!(!cache.store("f", StatusCode::OK, &headers(&[fresh, ("x-big", &long_header)]), Bytes::new(), now));

        assert!(cache.is_empty());
        assert_eq!(cache.stats().stores, 6);
        assert_eq!(cache.stats().store_successes, 0);
    }

    #[test]
    fn test_body_at_limit_is_storable() {
        let mut cache = cache();
        let body = Bytes::from(vec![b'x'; MAX_BODY_SIZE]);
        let h = headers(&[("cache-control", "max-age=5")]);
        assert!(cache.store("k", StatusCode::OK, &h, body, SystemTime::now()));
    }

    #[test]
    fn test_key_too_long() {
        let path = format!("/{}", "a".repeat(MAX_KEY_LENGTH));
        assert!(ResponseCache::key_for("http", "h", &path).is_none());
    }

    #[test]
    fn test_expires_header() {
        let mut cache = cache();
        let now = SystemTime::now();
        let h = headers(&[("expires", &http_date(now + Duration::from_secs(120)))]);
        assert!(cache.store("k", StatusCode::OK, &h, Bytes::new(), now));
        assert!(cache.fetch("k", now + Duration::from_secs(100)).is_some());

        let past = headers(&[("expires", &http_date(now - Duration::from_secs(120)))]);
        assert!(!cache.store("old", StatusCode::OK, &past, Bytes::new(), now));
    }

    #[test]
    fn test_last_modified_heuristic_uses_floor() {
        let mut cache = ResponseCache::new(Duration::from_secs(5));
        let now = SystemTime::now();
        // modified 10s ago: 10% is 1s, the 5s floor wins
        let h = headers(&[
            ("date", &http_date(now)),
            ("last-modified", &http_date(now - Duration::from_secs(10))),
        ]);
        assert!(cache.store("k", StatusCode::OK, &h, Bytes::new(), now));
        assert!(cache.fetch("k", now + Duration::from_secs(4)).is_some());
        assert!(cache.fetch("k", now + Duration::from_secs(6)).is_none());
    }

    #[test]
    fn test_default_freshness_without_validators() {
        let mut cache = cache();
        cache.set_default_freshness(Duration::from_secs(3));
        let now = SystemTime::now();
        assert!(cache.store("k", StatusCode::OK, &headers(&[("content-type", "text/html")]), Bytes::new(), now));
        assert!(cache.fetch("k", now + Duration::from_secs(2)).is_some());
        assert!(cache.fetch("k", now + Duration::from_secs(4)).is_none());

        // Last-Modified in the future says nothing useful either
        let h = headers(&[
            ("date", &http_date(now)),
            ("last-modified", &http_date(now + Duration::from_secs(60))),
        ]);
        assert!(cache.store("future", StatusCode::OK, &h, Bytes::new(), now));
        assert!(cache.fetch("future", now + Duration::from_secs(2)).is_some());
    }

    #[test]
    fn test_unparseable_last_modified_lives_one_second() {
        let mut cache = cache();
        let now = SystemTime::now();
        let h = headers(&[("last-modified", "yesterday-ish")]);
        assert!(cache.store("k", StatusCode::OK, &h, Bytes::new(), now));
        assert!(cache.fetch("k", now + Duration::from_millis(500)).is_some());
        assert!(cache.fetch("k", now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_evicts_stalest_entry() {
        let mut cache = cache();
        let now = SystemTime::now();
        for i in 0..MAX_ENTRIES {
            let date = now - Duration::from_secs(100 - i as u64);
            let h = headers(&[("cache-control", "max-age=600"), ("date", &http_date(date))]);
            assert!(cache.store(&format!("k{}", i), StatusCode::OK, &h, Bytes::new(), now));
        }
        assert_eq!(cache.len(), MAX_ENTRIES);

        let h = headers(&[("cache-control", "max-age=600"), ("date", &http_date(now))]);
        assert!(cache.store("new", StatusCode::OK, &h, Bytes::new(), now));
        assert_eq!(cache.len(), MAX_ENTRIES);
        assert!(cache.fetch("k0", now).is_none());
        assert!(cache.fetch("k1", now).is_some());
        assert!(cache.fetch("new", now).is_some());
    }

    #[test]
    fn test_request_eligibility() {
        let none = HeaderMap::new();
        assert!(ResponseCache::request_allows_fetch(&Method::GET, &none));
        assert!(!ResponseCache::request_allows_fetch(&Method::POST, &none));
        assert!(!ResponseCache::request_allows_fetch(
            &Method::GET,
            &headers(&[("cache-control", "no-cache")])
        ));
        assert!(!ResponseCache::request_allows_fetch(
            &Method::GET,
            &headers(&[("pragma", "no-cache")])
        ));
        assert!(!ResponseCache::request_allows_store(
            &Method::GET,
            &headers(&[("authorization", "Bearer x")])
        ));
    }

    #[test]
    fn test_counter_rollover() {
        let mut counter = u32::MAX;
        bump(&mut counter);
        assert_eq!(counter, 1);
    }

    #[test]
    fn test_ratios() {
        let stats = CacheStats {
            fetches: 4,
            hits: 1,
            stores: 2,
            store_successes: 2,
        };
        assert_eq!(stats.hit_ratio(), 0.25);
        assert_eq!(stats.store_success_ratio(), 1.0);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
