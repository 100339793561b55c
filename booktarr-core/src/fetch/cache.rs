//! In-process response caching.
//!
//! A bounded TTL+LRU map, sharded by purpose: book records, API
//! responses, and fetched pages each get independent sizes and TTLs.
//! Expired entries are dropped lazily on lookup; once a shard is full,
//! least-recently-used entries make room. The API shard alone accepts
//! a per-write TTL override and can sit on a durable backing store for
//! long-lived responses such as series metadata.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheSettings;
use crate::fetch::durable::DurableResponseStore;

/// Cache key for an outbound request: SHA-256 over the source name,
/// the canonical URL, and the sorted query parameters.
pub fn fingerprint(source: &str, url: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(url.as_bytes());
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub ttl_s: u64,
}

#[derive(Debug)]
struct Entry {
    payload: Value,
    inserted_at: Instant,
    ttl: Duration,
    seq: u64,
    hits: u64,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Bounded mapping with lazy TTL expiry and LRU eviction. The recency
/// index maps an insertion/access sequence number back to the key, so
/// eviction pops the smallest sequence.
#[derive(Debug)]
pub struct TtlLruCache {
    entries: HashMap<String, Entry>,
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    max_size: usize,
    default_ttl: Duration,
    hits: u64,
    misses: u64,
}

impl TtlLruCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_seq: 0,
            max_size: max_size.max(1),
            default_ttl,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.expired(now),
        };

        if expired {
            self.remove(key);
            self.misses += 1;
            return None;
        }

        let seq = self.bump_seq();
        let Some(entry) = self.entries.get_mut(key) else {
            self.misses += 1;
            return None;
        };
        self.recency.remove(&entry.seq);
        entry.seq = seq;
        self.recency.insert(seq, key.to_string());
        entry.hits += 1;
        self.hits += 1;
        Some(entry.payload.clone())
    }

    /// Insert with the shard TTL, or a per-entry override.
    pub fn insert(&mut self, key: &str, payload: Value, ttl: Option<Duration>) {
        self.remove(key);
        self.evict_expired();
        while self.entries.len() >= self.max_size {
            let Some((_, lru_key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&lru_key);
        }

        let seq = self.bump_seq();
        self.recency.insert(seq, key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                payload,
                inserted_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                seq,
                hits: 0,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.hits = 0;
        self.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            size: self.entries.len(),
            max_size: self.max_size,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total > 0 {
                self.hits as f64 / total as f64
            } else {
                0.0
            },
            ttl_s: self.default_ttl.as_secs(),
        }
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ResponseCacheStats {
    pub books: CacheStats,
    pub api: CacheStats,
    pub pages: CacheStats,
}

/// The three cache shards plus the optional durable layer under the
/// API shard.
#[derive(Debug)]
pub struct ResponseCache {
    books: Mutex<TtlLruCache>,
    api: Mutex<TtlLruCache>,
    pages: Mutex<TtlLruCache>,
    durable: Option<Arc<dyn DurableResponseStore>>,
}

impl ResponseCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            books: Mutex::new(TtlLruCache::new(
                settings.max_entries,
                Duration::from_secs(settings.book_ttl_s),
            )),
            api: Mutex::new(TtlLruCache::new(
                settings.max_entries / 2,
                Duration::from_secs(settings.api_ttl_s),
            )),
            pages: Mutex::new(TtlLruCache::new(
                100,
                Duration::from_secs(settings.page_ttl_s),
            )),
            durable: None,
        }
    }

    pub fn with_durable(mut self, store: Arc<dyn DurableResponseStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub async fn get_book(&self, isbn13: &str) -> Option<Value> {
        self.books.lock().await.get(&format!("book:{isbn13}"))
    }

    pub async fn set_book(&self, isbn13: &str, payload: Value) {
        self.books
            .lock()
            .await
            .insert(&format!("book:{isbn13}"), payload, None);
    }

    /// API-shard lookup: memory first, then the durable layer. A
    /// durable hit is promoted back into memory with its remaining
    /// lifetime.
    pub async fn get_api_response(&self, fingerprint: &str) -> Option<Value> {
        if let Some(payload) = self.api.lock().await.get(fingerprint) {
            debug!(fingerprint, "cache HIT (memory)");
            return Some(payload);
        }

        let store = self.durable.as_ref()?;
        match store.get(fingerprint).await {
            Ok(Some((payload, expires_at))) => {
                let remaining = (expires_at - Utc::now()).to_std().ok()?;
                debug!(fingerprint, "cache HIT (durable)");
                self.api
                    .lock()
                    .await
                    .insert(fingerprint, payload.clone(), Some(remaining));
                Some(payload)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(fingerprint, %err, "durable cache lookup failed");
                None
            }
        }
    }

    /// API-shard write. `ttl` overrides the shard default for this
    /// entry only; the book and page shards deliberately have no such
    /// override.
    pub async fn set_api_response(&self, fingerprint: &str, payload: Value, ttl: Option<Duration>) {
        self.api.lock().await.insert(fingerprint, payload, ttl);
    }

    /// API-shard write that also persists through the durable layer,
    /// for responses worth keeping across restarts.
    pub async fn set_api_response_durable(&self, fingerprint: &str, payload: Value, ttl: Duration) {
        self.api
            .lock()
            .await
            .insert(fingerprint, payload.clone(), Some(ttl));

        if let Some(store) = &self.durable {
            let expires_at = Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(30));
            if let Err(err) = store.put(fingerprint, &payload, expires_at).await {
                tracing::warn!(fingerprint, %err, "durable cache write failed");
            }
        }
    }

    pub async fn get_page(&self, fingerprint: &str) -> Option<Value> {
        self.pages.lock().await.get(&format!("page:{fingerprint}"))
    }

    pub async fn set_page(&self, fingerprint: &str, payload: Value) {
        self.pages
            .lock()
            .await
            .insert(&format!("page:{fingerprint}"), payload, None);
    }

    pub async fn clear_all(&self) {
        self.books.lock().await.clear();
        self.api.lock().await.clear();
        self.pages.lock().await.clear();
    }

    pub async fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            books: self.books.lock().await.stats(),
            api: self.api.lock().await.stats(),
            pages: self.pages.lock().await.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_served() {
        let mut cache = TtlLruCache::new(10, Duration::from_secs(5));
        cache.insert("k", json!(1), None);
        assert_eq!(cache.get("k"), Some(json!(1)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_ttl_beats_the_shard_default() {
        let mut cache = TtlLruCache::new(10, Duration::from_secs(1000));
        cache.insert("short", json!(1), Some(Duration::from_secs(2)));
        cache.insert("default", json!(2), None);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("default"), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_entry_is_evicted_at_the_bound() {
        let mut cache = TtlLruCache::new(3, Duration::from_secs(1000));
        cache.insert("a", json!(1), None);
        cache.insert("b", json!(2), None);
        cache.insert("c", json!(3), None);

        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.get("a").is_some());
        cache.insert("d", json!(4), None);

        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_hits_and_misses() {
        let mut cache = TtlLruCache::new(10, Duration::from_secs(60));
        cache.insert("k", json!(1), None);
        cache.get("k");
        cache.get("k");
        cache.get("absent");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fingerprint_is_stable_under_param_order() {
        let a = fingerprint("google_books", "https://example.com/v", &[("q", "x"), ("key", "k")]);
        let b = fingerprint("google_books", "https://example.com/v", &[("key", "k"), ("q", "x")]);
        let c = fingerprint("open_library", "https://example.com/v", &[("q", "x"), ("key", "k")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
