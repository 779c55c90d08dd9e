//! Result cache: request fingerprint → signed image URL
//!
//! Entries are keyed by a SHA-256 fingerprint over the canonical
//! serialization of `(url, width, height, format)` and expire on a TTL
//! checked at read time. When full, the oldest-accessed tenth of the
//! entries is evicted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{ImageFormat, ResultCacheSettings};

/// Opportunistic expired-entry sweeps run at most this often.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// SHA-256 fingerprint of the capture parameters.
///
/// The serialization is key-sorted so the fingerprint is stable across
/// call sites.
pub fn fingerprint(url: &str, width: u32, height: u32, format: ImageFormat) -> String {
    let canonical = format!(
        "{{\"format\":\"{}\",\"height\":{},\"url\":{},\"width\":{}}}",
        format.extension(),
        height,
        serde_json::to_string(url).unwrap_or_else(|_| format!("\"{url}\"")),
        width,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    /// Originating request URL, kept for exact-match invalidation
    url: String,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResultCacheStats {
    pub enabled: bool,
    pub size: usize,
    pub max_items: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub hit_rate: f64,
    /// Age of the longest-resident entry, in seconds
    pub oldest_entry_secs: Option<u64>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    stores: u64,
    last_cleanup: Instant,
}

pub struct ResultCache {
    enabled: bool,
    max_items: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(settings: &ResultCacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_items: settings.max_items,
            ttl: settings.ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                stores: 0,
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Look up the signed URL for a capture request.
    ///
    /// A stale hit evicts the entry and counts as a miss.
    pub async fn get(
        &self,
        url: &str,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let key = fingerprint(url, width, height, format);
        let mut inner = self.inner.lock().await;

        self.maybe_cleanup(&mut inner);

        match inner.entries.get_mut(&key) {
            Some(entry) if entry.is_expired() => {
                inner.entries.remove(&key);
                inner.misses += 1;
                None
            }
            Some(entry) => {
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub async fn set(
        &self,
        url: &str,
        width: u32,
        height: u32,
        format: ImageFormat,
        signed_url: String,
    ) {
        if !self.enabled {
            return;
        }

        let key = fingerprint(url, width, height, format);
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        if inner.entries.len() >= self.max_items {
            Self::evict_oldest_accessed(&mut inner);
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value: signed_url,
                url: url.to_string(),
                created_at: now,
                expires_at: now + self.ttl,
                last_accessed: now,
                access_count: 0,
            },
        );
        inner.stores += 1;
    }

    /// Drop cached results.
    ///
    /// With a URL, removes exactly the entries whose originating request
    /// URL equals it; without one, flushes everything. Returns the number
    /// of entries removed.
    pub async fn invalidate(&self, url: Option<&str>) -> usize {
        let mut inner = self.inner.lock().await;
        match url {
            None => {
                let count = inner.entries.len();
                inner.entries.clear();
                debug!(count, "result cache flushed");
                count
            }
            Some(url) => {
                let before = inner.entries.len();
                inner.entries.retain(|_, entry| entry.url != url);
                let removed = before - inner.entries.len();
                debug!(url, removed, "result cache entries invalidated");
                removed
            }
        }
    }

    pub async fn stats(&self) -> ResultCacheStats {
        let inner = self.inner.lock().await;
        let total = inner.hits + inner.misses;
        ResultCacheStats {
            enabled: self.enabled,
            size: inner.entries.len(),
            max_items: self.max_items,
            ttl_secs: self.ttl.as_secs(),
            hits: inner.hits,
            misses: inner.misses,
            stores: inner.stores,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
            oldest_entry_secs: inner
                .entries
                .values()
                .map(|e| e.created_at.elapsed().as_secs())
                .max(),
        }
    }

    fn maybe_cleanup(&self, inner: &mut CacheInner) {
        if inner.last_cleanup.elapsed() < CLEANUP_INTERVAL {
            return;
        }
        inner.last_cleanup = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired());
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "expired result cache entries swept");
        }
    }

    /// Evict the oldest-accessed 10% of entries (at least one).
    fn evict_oldest_accessed(inner: &mut CacheInner) {
        let mut by_access: Vec<(String, Instant)> = inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed))
            .collect();
        by_access.sort_by_key(|(_, accessed)| *accessed);

        let to_remove = (by_access.len() / 10).max(1);
        for (key, _) in by_access.into_iter().take(to_remove) {
            inner.entries.remove(&key);
        }
    }
}
