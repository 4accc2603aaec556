use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use url::Url;

use crate::error::NetworkError;
use crate::response::Response;

/// Prefix shared by every cache this crate creates.
pub const CACHE_PREFIX: &str = "citadel-edge";

/// Configuration for a resource cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum cache size in bytes
    pub max_size_bytes: usize,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Default TTL for cached entries
    pub default_ttl: Duration,
    /// Maximum TTL allowed
    pub max_ttl: Duration,
    /// Whether to respect Cache-Control headers
    pub respect_cache_control: bool,
    /// Serve expired entries instead of dropping them; the caller revalidates
    pub serve_stale: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024, // 50MB
            max_entries: 1000,
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(24 * 3600),
            respect_cache_control: true,
            serve_stale: true,
        }
    }
}

/// Cache entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cached response
    pub response: Response,
    /// When this entry was created
    pub created_at: Instant,
    /// When this entry expires
    pub expires_at: Instant,
    /// Size of the entry in bytes
    pub size_bytes: usize,
    /// Access count for LRU eviction
    pub access_count: u64,
    /// Last access time for LRU eviction
    pub last_accessed: Instant,
}

impl CacheEntry {
    /// Create a new cache entry from a response
    pub fn new(response: Response, ttl: Duration) -> Self {
        let now = Instant::now();
        let size_bytes = response.body().len()
            + response
                .headers()
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + response.url().as_str().len();

        Self {
            response,
            created_at: now,
            expires_at: now + ttl,
            size_bytes,
            access_count: 1,
            last_accessed: now,
        }
    }

    /// Check if this entry is expired
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// Mark this entry as accessed (for LRU tracking)
    pub fn mark_accessed(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    current_size: usize,
}

/// Resource cache keyed by request URL with LRU eviction
#[derive(Debug)]
pub struct ResourceCache {
    name: String,
    inner: RwLock<CacheInner>,
    config: CacheConfig,
}

impl ResourceCache {
    /// Create a new resource cache with the given configuration
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(CacheInner::default()),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a cached response
    ///
    /// Expired entries are returned when `serve_stale` is set and dropped
    /// otherwise.
    pub fn get(&self, url: &Url) -> Option<Response> {
        let key = cache_key(url);
        let mut inner = self.inner.write();

        let entry = inner.entries.get_mut(&key)?;
        if !entry.is_expired() || self.config.serve_stale {
            entry.mark_accessed();
            let mut response = entry.response.clone();
            response.set_from_cache(true);
            return Some(response);
        }

        if let Some(removed) = inner.entries.remove(&key) {
            inner.current_size = inner.current_size.saturating_sub(removed.size_bytes);
        }
        None
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.inner.read().entries.contains_key(&cache_key(url))
    }

    /// Store a response in the cache
    ///
    /// Only the status decides whether a response is stored; Cache-Control
    /// sets its freshness. Returns `Ok(false)` when the status is not
    /// cacheable.
    pub fn put(&self, url: &Url, response: Response) -> Result<bool, NetworkError> {
        if !response.is_cacheable() {
            return Ok(false);
        }

        let ttl = self.calculate_ttl(&response);

        let entry = CacheEntry::new(response, ttl);
        if entry.size_bytes > self.config.max_size_bytes {
            return Err(NetworkError::ResourceError(format!(
                "Response too large to cache: {} bytes",
                entry.size_bytes
            )));
        }

        let key = cache_key(url);
        let mut inner = self.inner.write();
        if let Some(old_entry) = inner.entries.remove(&key) {
            inner.current_size = inner.current_size.saturating_sub(old_entry.size_bytes);
        }

        self.ensure_space_for(&mut inner, entry.size_bytes);

        inner.current_size += entry.size_bytes;
        inner.entries.insert(key, entry);
        Ok(true)
    }

    /// Calculate TTL for a response based on headers and configuration
    fn calculate_ttl(&self, response: &Response) -> Duration {
        if !self.config.respect_cache_control {
            return self.config.default_ttl;
        }

        if let Some(cache_control) = response.header("cache-control") {
            let cc = cache_control.to_lowercase();

            if cc.contains("no-store") {
                return Duration::ZERO;
            }

            if let Some(max_age_start) = cc.find("max-age=") {
                let digits: String = cc[max_age_start + 8..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if let Ok(seconds) = digits.parse::<u64>() {
                    return std::cmp::min(Duration::from_secs(seconds), self.config.max_ttl);
                }
            }
        }

        std::cmp::min(self.config.default_ttl, self.config.max_ttl)
    }

    /// Evict least recently used entries until `size_bytes` fits
    fn ensure_space_for(&self, inner: &mut CacheInner, size_bytes: usize) {
        while inner.current_size + size_bytes > self.config.max_size_bytes
            || inner.entries.len() >= self.config.max_entries
        {
            let lru_key = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.last_accessed, entry.access_count))
                .map(|(key, _)| key.clone());

            let Some(key) = lru_key else { break };
            if let Some(removed) = inner.entries.remove(&key) {
                inner.current_size = inner.current_size.saturating_sub(removed.size_bytes);
                log::debug!(
                    "Evicted cache entry cache={} url={} bytes={}",
                    self.name,
                    key,
                    removed.size_bytes
                );
            }
        }
    }
}

fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Named caches shared by every interceptor version of a process.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Arc<ResourceCache>>>,
    config: CacheConfig,
}

impl CacheStorage {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Open a cache, creating it if it does not exist
    pub fn open(&self, name: &str) -> Arc<ResourceCache> {
        if let Some(cache) = self.caches.read().get(name) {
            return Arc::clone(cache);
        }
        let mut caches = self.caches.write();
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ResourceCache::new(name, self.config.clone()))),
        )
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.read().contains_key(name)
    }

    pub fn delete(&self, name: &str) -> bool {
        self.caches.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete every cache of ours not listed in `keep`; returns the deleted names
    pub fn delete_stale(&self, keep: &[String]) -> Vec<String> {
        let mut caches = self.caches.write();
        let stale: Vec<String> = caches
            .keys()
            .filter(|name| name.starts_with(CACHE_PREFIX) && !keep.contains(name))
            .cloned()
            .collect();
        for name in &stale {
            caches.remove(name);
        }
        stale
    }
}
