//! On-disk cache for sub-resources fetched during page loads
//!
//! Pages loading the same stylesheets, scripts, fonts and images over and
//! over are the dominant cost of repeated captures. A route handler
//! answers eligible requests from a shared disk cache and persists cache
//! misses as their responses stream back.
//!
//! The index lives in memory and is rebuilt empty on restart; payloads
//! are flat files named `<sha256>.cache` under the screenshot directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{ResourceClass, RouteDecision, RouteHandler, RouteRequest};
use crate::config::ContentCacheSettings;
use crate::error::ScreenshotError;
use crate::storage::UrlRewriter;

/// Asset extensions cacheable in the default (selective) mode.
const ASSET_EXTENSIONS: &[&str] = &[
    // stylesheets
    ".css",
    // scripts
    ".js", ".mjs",
    // fonts
    ".woff", ".woff2", ".ttf", ".otf", ".eot",
    // images
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico",
    // media
    ".mp4", ".webm", ".ogg", ".mp3", ".wav",
];

/// Extensions additionally cacheable in all-content mode.
const ALL_CONTENT_EXTENSIONS: &[&str] = &[
    // documents
    ".html", ".pdf", ".json", ".xml",
    // data
    ".csv", ".tsv",
    // archives
    ".zip", ".gz", ".tar",
    // other
    ".wasm", ".map",
];

/// Path fragments that are never cached (state-changing or per-user).
const EXCLUDED_PATH_PATTERNS: &[&str] = &[
    "/api/", "/graphql", "/auth/", "/login", "/logout", "/ws/", "/websocket", "/analytics",
    "/track", "/admin/",
];

/// Query parameter names that make a URL dynamic.
const DYNAMIC_QUERY_KEYS: &[&str] = &["timestamp", "time", "now", "rand", "token", "session"];

/// Disk usage above this fraction of the configured maximum triggers LRU
/// eviction during cleanup.
const HIGH_WATER_FRACTION: f64 = 0.8;

#[derive(Debug, Clone)]
struct ContentEntry {
    path: PathBuf,
    /// Lowercased response header names → values
    headers: HashMap<String, String>,
    size: u64,
    stored_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContentCacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub total_size: u64,
    pub max_total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub errors: u64,
}

pub struct ContentCache {
    settings: ContentCacheSettings,
    cache_dir: PathBuf,
    rewriter: Arc<dyn UrlRewriter>,
    index: DashMap<String, ContentEntry>,
    total_size: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

impl ContentCache {
    pub async fn new(
        settings: ContentCacheSettings,
        screenshot_dir: &Path,
        rewriter: Arc<dyn UrlRewriter>,
    ) -> Result<Arc<Self>, ScreenshotError> {
        let cache_dir = screenshot_dir.join("browser_cache");
        tokio::fs::create_dir_all(&cache_dir).await?;
        info!(dir = %cache_dir.display(), "content cache initialized");

        Ok(Arc::new(Self {
            settings,
            cache_dir,
            rewriter,
            index: DashMap::new(),
            total_size: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }))
    }

    fn cache_key(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.cache"))
    }

    /// Canonical form of a URL for keying: internal-host rewrites undone.
    fn canonical_url(&self, url: &str) -> String {
        self.rewriter.reverse(url)
    }

    /// Whether a request may be served from / stored into the cache.
    pub fn is_cacheable(&self, url: &str, resource_type: Option<ResourceClass>) -> bool {
        if !self.settings.enabled {
            return false;
        }

        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let path_lower = parsed.path().to_lowercase();

        if EXCLUDED_PATH_PATTERNS
            .iter()
            .any(|p| path_lower.contains(p) || path_lower.ends_with(p.trim_end_matches('/')))
        {
            return false;
        }

        if parsed
            .query_pairs()
            .any(|(k, _)| DYNAMIC_QUERY_KEYS.contains(&k.to_lowercase().as_str()))
        {
            return false;
        }

        if let Some(host) = parsed.host_str() {
            let host = host.to_lowercase();
            if self
                .settings
                .priority_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&host))
            {
                return true;
            }
        }

        if ASSET_EXTENSIONS.iter().any(|ext| path_lower.ends_with(ext)) {
            return true;
        }
        if self.settings.all_content
            && ALL_CONTENT_EXTENSIONS
                .iter()
                .any(|ext| path_lower.ends_with(ext))
        {
            return true;
        }

        matches!(
            resource_type,
            Some(
                ResourceClass::Stylesheet
                    | ResourceClass::Script
                    | ResourceClass::Font
                    | ResourceClass::Image
            )
        )
    }

    /// Fetch a cached payload; stale or missing-on-disk entries are
    /// evicted and count as misses.
    pub async fn get(&self, url: &str) -> Option<(Vec<u8>, HashMap<String, String>)> {
        let key = Self::cache_key(&self.canonical_url(url));

        let (path, headers) = match self.index.get_mut(&key) {
            Some(mut entry) => {
                if entry.stored_at.elapsed() > self.settings.ttl {
                    drop(entry);
                    self.evict(&key).await;
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                (entry.path.clone(), entry.headers.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(url, size = bytes.len(), "content cache hit");
                Some((bytes, headers))
            }
            Err(e) => {
                // Index said yes but the payload is gone; repair the index
                warn!(url, error = %e, "content cache payload missing, evicting entry");
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.evict(&key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Persist a response payload. Oversized payloads are skipped.
    pub async fn store(&self, url: &str, content: &[u8], headers: &HashMap<String, String>) -> bool {
        if !self.settings.enabled || content.len() as u64 > self.settings.max_file_size {
            return false;
        }

        let canonical = self.canonical_url(url);
        let key = Self::cache_key(&canonical);
        let path = self.cache_path(&key);

        if let Err(e) = tokio::fs::write(&path, content).await {
            warn!(url, error = %e, "failed to persist cached content");
            self.errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let lowercased: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();

        let size = content.len() as u64;
        let now = Instant::now();
        let previous = self.index.insert(
            key,
            ContentEntry {
                path,
                headers: lowercased,
                size,
                stored_at: now,
                last_accessed: now,
                access_count: 0,
            },
        );
        if let Some(previous) = previous {
            self.total_size.fetch_sub(previous.size, Ordering::Relaxed);
        }
        self.total_size.fetch_add(size, Ordering::Relaxed);
        self.stores.fetch_add(1, Ordering::Relaxed);
        debug!(url, size, "content cached");
        true
    }

    async fn evict(&self, key: &str) {
        if let Some((_, entry)) = self.index.remove(key) {
            self.total_size.fetch_sub(entry.size, Ordering::Relaxed);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %entry.path.display(), error = %e, "failed to remove cached payload");
                    self.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drop expired entries, then enforce the disk high-water mark by
    /// evicting least-recently-used entries.
    pub async fn cleanup(&self) -> usize {
        let mut removed = 0usize;

        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|e| e.stored_at.elapsed() > self.settings.ttl)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.evict(&key).await;
            removed += 1;
        }

        let high_water = (self.settings.max_total_size as f64 * HIGH_WATER_FRACTION) as u64;
        if self.total_size.load(Ordering::Relaxed) > high_water {
            let mut by_access: Vec<(String, Instant)> = self
                .index
                .iter()
                .map(|e| (e.key().clone(), e.last_accessed))
                .collect();
            by_access.sort_by_key(|(_, accessed)| *accessed);

            for (key, _) in by_access {
                if self.total_size.load(Ordering::Relaxed) <= high_water {
                    break;
                }
                self.evict(&key).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "content cache cleanup pass complete");
        }
        removed
    }

    /// Remove every entry and payload.
    pub async fn clear(&self) -> usize {
        let keys: Vec<String> = self.index.iter().map(|e| e.key().clone()).collect();
        let count = keys.len();
        for key in keys {
            self.evict(&key).await;
        }
        count
    }

    /// Spawn the periodic cleanup loop. The caller owns the handle and
    /// aborts it during shutdown.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.settings.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup().await;
            }
        })
    }

    pub fn stats(&self) -> ContentCacheStats {
        ContentCacheStats {
            enabled: self.settings.enabled,
            entries: self.index.len(),
            total_size: self.total_size.load(Ordering::Relaxed),
            max_total_size: self.settings.max_total_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Route handler serving eligible requests from the shared cache.
pub struct CachingRouteHandler {
    cache: Arc<ContentCache>,
}

impl CachingRouteHandler {
    pub fn new(cache: Arc<ContentCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl RouteHandler for CachingRouteHandler {
    async fn on_request(&self, request: &RouteRequest) -> RouteDecision {
        if request.method != "GET"
            || !self.cache.is_cacheable(&request.url, Some(request.resource_type))
        {
            return RouteDecision::Continue;
        }

        match self.cache.get(&request.url).await {
            Some((body, headers)) => RouteDecision::Fulfill {
                status: 200,
                headers,
                body,
            },
            None => RouteDecision::Continue,
        }
    }

    fn wants_response(&self, request: &RouteRequest) -> bool {
        request.method == "GET"
            && self.cache.is_cacheable(&request.url, Some(request.resource_type))
    }

    async fn on_response(&self, url: &str, headers: &HashMap<String, String>, body: &[u8]) {
        if !self.cache.is_cacheable(url, None) {
            return;
        }
        // Persist off the interception path
        let cache = Arc::clone(&self.cache);
        let url = url.to_string();
        let headers = headers.clone();
        let body = body.to_vec();
        tokio::spawn(async move {
            cache.store(&url, &body, &headers).await;
        });
    }
}
