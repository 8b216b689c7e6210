//! Profile lookup with a small read-through cache.
//!
//! Profiles are fetched from the upstream on a miss and kept in a bounded
//! least-recently-used cache. Entries older than the configured maximum age
//! are treated as absent and refetched.

use crate::source::SourceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default maximum number of cached profiles.
pub const DEFAULT_CACHE_CAPACITY: usize = 20;

/// Default freshness window for a cached profile.
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(15 * 60);

/// An upstream profile record, passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile(pub Value);

impl Profile {
    /// Wrap an upstream record.
    #[must_use]
    pub fn new(record: Value) -> Self {
        Self(record)
    }

    /// The screen name carried by the record, if any.
    #[must_use]
    pub fn screen_name(&self) -> Option<&str> {
        self.0.get("screen_name").and_then(Value::as_str)
    }
}

/// The external profile endpoint.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Fetch the profile for `screen_name`.
    async fn fetch_profile(&self, screen_name: &str) -> Result<Profile, SourceError>;
}

struct CacheEntry {
    profile: Arc<Profile>,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing fresh.
    pub misses: u64,
    /// Entries currently held.
    pub len: usize,
}

/// Bounded LRU cache with age-based expiry.
pub struct ProfileCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    max_age: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProfileCache {
    /// Create a cache (capacity is at least one).
    #[must_use]
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a fresh entry, marking it most recently used.
    ///
    /// Expired entries are removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<Arc<Profile>> {
        let mut inner = self.lock();
        let now = Instant::now();
        let tick = inner.tick();

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.max_age => {
                entry.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.profile));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            trace!(key, "Cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry, evicting the least recently used one when
    /// the cache is full.
    pub fn insert(&self, key: impl Into<String>, profile: Arc<Profile>) {
        let key = key.into();
        let mut inner = self.lock();
        let tick = inner.tick();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                trace!(key = %oldest, "Evicted least recently used entry");
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                profile,
                inserted_at: Instant::now(),
                last_used: tick,
            },
        );
    }

    /// Number of held entries (fresh or not yet pruned).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Freshness window.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Get cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_MAX_AGE)
    }
}

/// Read-through profile lookup.
pub struct ProfileLookup {
    source: Arc<dyn ProfileSource>,
    cache: ProfileCache,
}

impl ProfileLookup {
    /// Create a lookup service owning `cache`.
    #[must_use]
    pub fn new(source: Arc<dyn ProfileSource>, cache: ProfileCache) -> Self {
        Self { source, cache }
    }

    /// Return the cached profile, or fetch and cache it.
    ///
    /// # Errors
    ///
    /// Returns the upstream error on a miss that cannot be fetched. Failures
    /// are not cached.
    pub async fn retrieve(&self, screen_name: &str) -> Result<Arc<Profile>, SourceError> {
        if let Some(profile) = self.cache.get(screen_name) {
            trace!(screen_name, "Profile cache hit");
            return Ok(profile);
        }

        debug!(screen_name, "Profile cache miss, fetching");
        let profile = Arc::new(self.source.fetch_profile(screen_name).await?);
        self.cache.insert(screen_name, Arc::clone(&profile));
        Ok(profile)
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &ProfileCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProfiles;
    use serde_json::json;

    fn profile(name: &str) -> Arc<Profile> {
        Arc::new(Profile::new(json!({ "screen_name": name })))
    }

    #[test]
    fn test_profile_screen_name() {
        assert_eq!(profile("alice").screen_name(), Some("alice"));
        assert_eq!(Profile::new(json!({})).screen_name(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_and_miss() {
        let cache = ProfileCache::default();
        assert!(cache.get("alice").is_none());

        cache.insert("alice", profile("alice"));
        assert_eq!(cache.get("alice").unwrap().screen_name(), Some("alice"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.len, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_evicts_least_recently_used() {
        let cache = ProfileCache::new(20, DEFAULT_CACHE_MAX_AGE);
        for i in 0..20 {
            cache.insert(format!("user{}", i), profile(&format!("user{}", i)));
        }

        // Touch the oldest so user1 becomes the eviction candidate
        assert!(cache.get("user0").is_some());

        cache.insert("user20", profile("user20"));
        assert_eq!(cache.len(), 20);
        assert!(cache.get("user0").is_some());
        assert!(cache.get("user1").is_none());
        assert!(cache.get("user20").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_entry_does_not_evict() {
        let cache = ProfileCache::new(2, DEFAULT_CACHE_MAX_AGE);
        cache.insert("a", profile("a"));
        cache.insert("b", profile("b"));
        cache.insert("a", profile("a"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_expires() {
        let cache = ProfileCache::new(20, Duration::from_secs(60));
        cache.insert("alice", profile("alice"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("alice").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("alice").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_fetches_once_within_max_age() {
        let source = FakeProfiles::with(&["alice"]);
        let lookup = ProfileLookup::new(source.clone(), ProfileCache::default());

        for _ in 0..3 {
            let found = lookup.retrieve("alice").await.unwrap();
            assert_eq!(found.screen_name(), Some("alice"));
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(DEFAULT_CACHE_MAX_AGE).await;
        lookup.retrieve("alice").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_failures_not_cached() {
        let source = FakeProfiles::with(&[]);
        let lookup = ProfileLookup::new(source.clone(), ProfileCache::default());

        for _ in 0..2 {
            assert_eq!(
                lookup.retrieve("ghost").await,
                Err(SourceError::NotFound("ghost".into()))
            );
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert!(lookup.cache().is_empty());
    }
}
