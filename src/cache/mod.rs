/// In-process result cache for resolved character listings and builds
///
/// Entries live for a fixed TTL per cache instance. Expired entries are never
/// returned: a lookup that finds one deletes it and reports a miss. Losing the
/// cache only costs a redundant upstream call.

use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default TTL for cached results (60 seconds)
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live of every entry
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Time-bounded key/value store shared across concurrent requests
#[derive(Clone)]
pub struct ResultCache<V> {
    name: &'static str,
    entries: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
    ttl: Duration,
    closed: Arc<AtomicBool>,
}

impl<V: Clone> ResultCache<V> {
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        Self::named("result", config)
    }

    /// Create a new cache whose entry gauge is labelled `name`
    pub fn named(name: &'static str, config: CacheConfig) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: config.ttl,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a new cache with a specific TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(CacheConfig { ttl })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a key, evicting it if its TTL has elapsed
    pub fn get(&self, key: &str) -> Option<V> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut entries = self.entries.lock();
        let hit = match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                metrics::record_cache_entries(self.name, entries.len());
                debug!("Cache entry expired: {}", key);
                None
            }
            None => None,
        };
        drop(entries);

        metrics::record_cache_access(hit.is_some());
        hit
    }

    /// Store a value, replacing any previous entry and restarting its TTL
    pub fn set(&self, key: &str, value: V) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
        metrics::record_cache_entries(self.name, entries.len());
    }

    /// Remove a key
    pub fn delete(&self, key: &str) {
        let mut entries = self.entries.lock();
        entries.remove(key);
        metrics::record_cache_entries(self.name, entries.len());
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
        let removed = before - entries.len();
        metrics::record_cache_entries(self.name, entries.len());
        removed
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release all entries; later reads miss and writes are ignored
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.entries.lock().clear();
        metrics::record_cache_entries(self.name, 0);
    }
}

/// Build a cache key from its parts, lower-cased
pub fn build_key(category: &str, parts: &[&str]) -> String {
    format!("{}:{}", category, parts.join("|")).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl() {
        let cache = ResultCache::with_ttl(Duration::from_secs(60));
        cache.set("characters:alice|pc", vec!["Witch".to_string()]);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(
            cache.get("characters:alice|pc"),
            Some(vec!["Witch".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_after_ttl_and_evicted() {
        let cache = ResultCache::with_ttl(Duration::from_secs(60));
        cache.set("build:alice|witchy", "doc".to_string());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("build:alice|witchy"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_restarts_ttl() {
        let cache = ResultCache::with_ttl(Duration::from_secs(10));
        cache.set("k", 1u32);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", 2u32);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ResultCache::with_ttl(Duration::from_secs(10));
        cache.set("old", 1u32);
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("new", 2u32);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("new"), Some(2));
    }

    #[test]
    fn test_close_drops_entries() {
        let cache = ResultCache::with_ttl(Duration::from_secs(60));
        cache.set("k", 1u32);
        cache.close();

        assert!(cache.is_empty());
        cache.set("k", 2u32);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_delete() {
        let cache = ResultCache::with_ttl(Duration::from_secs(60));
        cache.set("k", 1u32);
        cache.delete("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_named_caches_report_their_own_entries() {
        let listings = ResultCache::named("cache_test_listings", CacheConfig::default());
        let builds = ResultCache::named("cache_test_builds", CacheConfig::default());
        listings.set("a", 1u32);
        listings.set("b", 2u32);
        builds.set("c", 3u32);

        let gauge = |name: &str| {
            metrics::RESULT_CACHE_ENTRIES
                .with_label_values(&[name])
                .get()
        };
        assert_eq!(gauge("cache_test_listings"), 2);
        assert_eq!(gauge("cache_test_builds"), 1);

        builds.close();
        assert_eq!(gauge("cache_test_listings"), 2);
        assert_eq!(gauge("cache_test_builds"), 0);
    }

    #[test]
    fn test_build_key_lowercases() {
        assert_eq!(
            build_key("characters", &["Alice", "PC"]),
            "characters:alice|pc"
        );
    }
}
