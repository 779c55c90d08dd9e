//! Capture pipeline orchestrating pools, caches and retries
//!
//! One `capture` call flows: throttle admission → result-cache lookup →
//! page acquisition (tab pool over the browser pool, or a bare managed
//! context) → route interception (resource blocking + content cache) →
//! progressive-fallback navigation under the target domain's retry
//! manager → capture → upload → sign → result-cache fill.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{
    ContextOptions, ResourceClass, RouteDecision, RouteHandler, RouteHandlerChain, RouteRequest,
    WaitUntil,
};
use crate::browser_pool::BrowserPool;
use crate::cache::ResultCache;
use crate::config::{CaptureRequest, SharedSettings};
use crate::content_cache::{CachingRouteHandler, ContentCache};
use crate::error::ScreenshotError;
use crate::metrics::MetricsCollector;
use crate::retry::{CircuitBreakerRegistry, RetryConfig, RetryManager};
use crate::storage::StorageCollaborators;
use crate::tab_pool::TabPool;
use crate::throttle::RequestThrottle;
use crate::utils::{extract_domain, is_same_domain};
use crate::watchdog::RequestActivity;

/// URL keywords marking script-heavy sites that need longer navigation
/// budgets.
const COMPLEX_SITE_KEYWORDS: &[&str] = &[
    "maps", "dashboard", "editor", "studio", "webgl", "canvas", "youtube", "twitch",
];

/// URL keywords marking image-heavy sites that get a settle delay before
/// capture.
const VISUAL_SITE_KEYWORDS: &[&str] = &[
    "gallery", "portfolio", "photo", "unsplash", "behance", "dribbble", "pinterest",
];

/// Extra render-settle wait for complex/visual sites.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Progressive navigation fallback: milestone plus the fraction of the
/// configured navigation budget it may spend.
const NAV_STRATEGIES: &[(WaitUntil, f64)] = &[
    (WaitUntil::Commit, 0.4),
    (WaitUntil::DomContentLoaded, 0.7),
    (WaitUntil::NetworkIdle, 0.5),
    (WaitUntil::Load, 0.9),
];

/// Outcome of a capture: the signed URL plus whether it came from cache.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CaptureOutcome {
    pub url: String,
    pub cached: bool,
    pub duration_ms: u64,
}

/// Aborts blocked resource classes before they leave the page.
struct BlockingRouteHandler {
    block_fonts: bool,
    block_media: bool,
    block_analytics: bool,
    block_ads: bool,
    block_social: bool,
    block_third_party: bool,
    page_url: String,
    blocked_domains: HashSet<&'static str>,
}

const AD_PATTERNS: &[&str] = &[
    "/ads/", "/ad/", "doubleclick", "googlesyndication", "adsystem", "adnxs",
];
const ANALYTICS_PATTERNS: &[&str] = &[
    "analytics", "tracking", "telemetry", "hotjar", "mixpanel", "segment", "gtag",
];
const SOCIAL_PATTERNS: &[&str] = &[
    "facebook.com/plugins", "platform.twitter.com", "instagram.com/embed", "linkedin.com/embed",
];

impl BlockingRouteHandler {
    fn new(settings: &crate::config::BlockingSettings, page_url: &str) -> Self {
        let mut blocked_domains = HashSet::new();
        blocked_domains.insert("googletagmanager.com");
        blocked_domains.insert("google-analytics.com");
        blocked_domains.insert("googleadservices.com");
        blocked_domains.insert("doubleclick.net");

        Self {
            block_fonts: settings.block_fonts,
            block_media: settings.block_media,
            block_analytics: settings.block_analytics,
            block_ads: settings.block_ads,
            block_social: settings.block_social,
            block_third_party: settings.block_third_party,
            page_url: page_url.to_string(),
            blocked_domains,
        }
    }

    fn should_block(&self, request: &RouteRequest) -> bool {
        let url_lower = request.url.to_lowercase();

        if self.block_fonts && request.resource_type == ResourceClass::Font {
            return true;
        }
        if self.block_media && request.resource_type == ResourceClass::Media {
            return true;
        }
        if self.block_analytics
            && (ANALYTICS_PATTERNS.iter().any(|p| url_lower.contains(p))
                || extract_domain(&request.url)
                    .map(|d| self.blocked_domains.contains(d.as_str()))
                    .unwrap_or(false))
        {
            return true;
        }
        if self.block_ads && AD_PATTERNS.iter().any(|p| url_lower.contains(p)) {
            return true;
        }
        if self.block_social && SOCIAL_PATTERNS.iter().any(|p| url_lower.contains(p)) {
            return true;
        }
        if self.block_third_party
            && request.resource_type != ResourceClass::Document
            && !is_same_domain(&self.page_url, &request.url)
        {
            return true;
        }
        false
    }
}

#[async_trait::async_trait]
impl RouteHandler for BlockingRouteHandler {
    async fn on_request(&self, request: &RouteRequest) -> RouteDecision {
        if self.should_block(request) {
            debug!(url = %request.url, "blocking resource");
            RouteDecision::Abort
        } else {
            RouteDecision::Continue
        }
    }
}

pub struct ScreenshotService {
    settings: SharedSettings,
    pub browser_pool: Arc<BrowserPool>,
    tab_pool: Option<Arc<TabPool>>,
    throttle: Arc<RequestThrottle>,
    pub result_cache: Arc<ResultCache>,
    pub content_cache: Arc<ContentCache>,
    storage: StorageCollaborators,
    metrics: Arc<MetricsCollector>,
    activity: Arc<RequestActivity>,
    breakers: CircuitBreakerRegistry,
    retry_managers: DashMap<String, Arc<RetryManager>>,
    screenshot_dir: PathBuf,
    shutting_down: AtomicBool,
    background_tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ScreenshotService {
    pub async fn new(
        settings: SharedSettings,
        browser_pool: Arc<BrowserPool>,
        tab_pool: Option<Arc<TabPool>>,
        storage: StorageCollaborators,
        metrics: Arc<MetricsCollector>,
        activity: Arc<RequestActivity>,
    ) -> Result<Arc<Self>, ScreenshotError> {
        let snapshot = settings.snapshot();
        let screenshot_dir = PathBuf::from(&snapshot.screenshot_dir);
        tokio::fs::create_dir_all(&screenshot_dir).await?;

        let result_cache = Arc::new(ResultCache::new(&snapshot.result_cache));
        let content_cache = ContentCache::new(
            snapshot.content_cache.clone(),
            &screenshot_dir,
            storage.rewriter.clone(),
        )
        .await?;

        let service = Arc::new(Self {
            throttle: Arc::new(RequestThrottle::new("capture", &snapshot.throttle)),
            breakers: CircuitBreakerRegistry::new(snapshot.circuit_breaker.clone()),
            retry_managers: DashMap::new(),
            settings,
            browser_pool,
            tab_pool,
            result_cache,
            content_cache: content_cache.clone(),
            storage,
            metrics,
            activity,
            screenshot_dir,
            shutting_down: AtomicBool::new(false),
            background_tasks: tokio::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = service.background_tasks.lock().await;
        tasks.push(content_cache.spawn_cleanup());
        tasks.push(service.clone().spawn_artifact_sweep());
        drop(tasks);

        Ok(service)
    }

    /// Capture a screenshot and return its signed URL.
    pub async fn capture(&self, request: CaptureRequest) -> Result<CaptureOutcome, ScreenshotError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(ScreenshotError::Internal("service is shutting down".into()));
        }
        request.validate()?;
        self.activity.record_request();

        let started = Instant::now();
        let result = self.throttle.execute(|| self.capture_inner(&request)).await;
        let duration = started.elapsed();

        match &result {
            Ok(outcome) => {
                self.metrics
                    .record_request("capture", 200, duration.as_secs_f64() * 1000.0)
                    .await;
                debug!(
                    url = %request.url,
                    cached = outcome.cached,
                    duration = ?duration,
                    "capture complete"
                );
            }
            Err(e) => {
                self.metrics
                    .record_request("capture", e.http_status(), duration.as_secs_f64() * 1000.0)
                    .await;
                self.metrics
                    .record_error(e.error_code(), "capture", &e.to_string())
                    .await;
            }
        }
        let pool_stats = self.browser_pool.stats().await;
        self.metrics
            .record_time_series("pool", "utilization", pool_stats.utilization)
            .await;
        self.metrics.update_pool_stats(pool_stats).await;
        result
    }

    async fn capture_inner(
        &self,
        request: &CaptureRequest,
    ) -> Result<CaptureOutcome, ScreenshotError> {
        let started = Instant::now();
        let target_url = self.storage.rewriter.transform(&request.url);

        if request.use_cache {
            if let Some(url) = self
                .result_cache
                .get(&request.url, request.width, request.height, request.format)
                .await
            {
                return Ok(CaptureOutcome {
                    url,
                    cached: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        let snapshot = self.settings.snapshot();

        // Acquire a page: tab pool when enabled, bare context otherwise
        let managed = self
            .browser_pool
            .managed_context(ContextOptions {
                user_agent: snapshot.user_agent.clone(),
            })
            .await?;

        let lease = match &self.tab_pool {
            Some(tab_pool) if snapshot.tabs.enabled => Some(
                tab_pool
                    .get_tab(
                        managed.slot_index(),
                        managed.context(),
                        request.width,
                        request.height,
                    )
                    .await?,
            ),
            _ => None,
        };
        let page = match &lease {
            Some(lease) => lease.page.clone(),
            None => {
                let page_timeout = snapshot.timeouts.page_creation;
                let page = timeout(page_timeout, managed.context().new_page())
                    .await
                    .map_err(|_| ScreenshotError::Timeout(page_timeout))??;
                page.set_viewport(request.width, request.height).await?;
                page
            }
        };

        let work = self.drive_page(&page, request, &target_url, &snapshot).await;

        let healthy = !matches!(
            work,
            Err(ScreenshotError::Browser(_))
                | Err(ScreenshotError::Timeout(_))
                | Err(ScreenshotError::CaptureFailed(_))
        );
        if let Some(lease) = lease {
            if let Some(tab_pool) = &self.tab_pool {
                tab_pool.release_tab(lease, healthy).await;
            }
        } else if let Err(e) = page.close().await {
            debug!(error = %e, "closing pipeline page failed");
        }
        let slot_index = managed.slot_index();
        managed.release(healthy).await;
        if !healthy {
            // The slot is being recycled; its pooled tabs die with it
            if let Some(tab_pool) = &self.tab_pool {
                tab_pool.forget_slot(slot_index).await;
            }
        }

        let filepath = work?;

        // Hand the artifact to storage and fill the cache
        let storage_key = self.storage.object_store.upload(&filepath).await?;
        let signed_url =
            self.storage
                .signer
                .sign(&storage_key, request.width, request.height, request.format)?;

        if request.use_cache {
            self.result_cache
                .set(
                    &request.url,
                    request.width,
                    request.height,
                    request.format,
                    signed_url.clone(),
                )
                .await;
        }

        Ok(CaptureOutcome {
            url: signed_url,
            cached: false,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Configure, navigate and capture on an acquired page. Returns the
    /// artifact path.
    async fn drive_page(
        &self,
        page: &Arc<dyn crate::browser::PageHandle>,
        request: &CaptureRequest,
        target_url: &str,
        snapshot: &crate::config::Settings,
    ) -> Result<PathBuf, ScreenshotError> {
        let handler: Arc<dyn RouteHandler> = Arc::new(RouteHandlerChain::new(vec![
            Arc::new(BlockingRouteHandler::new(&snapshot.blocking, target_url))
                as Arc<dyn RouteHandler>,
            Arc::new(CachingRouteHandler::new(self.content_cache.clone())),
        ]));
        page.install_route_handler(handler).await?;

        if let Some(user_agent) = &snapshot.user_agent {
            page.set_user_agent(user_agent).await?;
        }

        let complex = is_complex_site(target_url);
        let visual = is_visual_site(target_url);
        let nav_budget = if complex || visual {
            snapshot.timeouts.navigation_complex
        } else {
            snapshot.timeouts.navigation
        };

        self.navigate_with_fallback(page, target_url, nav_budget)
            .await?;

        if complex || visual {
            sleep(SETTLE_DELAY).await;
        }

        let filename = format!("{}.{}", Uuid::new_v4(), request.format.extension());
        let filepath = self.screenshot_dir.join(filename);

        let shot_timeout = snapshot.timeouts.screenshot;
        let bytes = match timeout(shot_timeout, page.capture(request.format)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(first_err)) => {
                // One immediate retry covers transient renderer hiccups
                warn!(error = %first_err, "capture failed, retrying once");
                sleep(Duration::from_secs(1)).await;
                match timeout(shot_timeout, page.capture(request.format)).await {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(e)) => return Err(ScreenshotError::CaptureFailed(e.to_string())),
                    Err(_) => return Err(ScreenshotError::Timeout(shot_timeout)),
                }
            }
            Err(_) => return Err(ScreenshotError::Timeout(shot_timeout)),
        };

        tokio::fs::write(&filepath, &bytes).await?;
        Ok(filepath)
    }

    /// Walk the wait-until ladder until one milestone lands.
    ///
    /// All-milestones-timed-out is not fatal: the page is captured as-is.
    /// Other navigation failures go through the domain's retry manager and
    /// surface after its budget, and an open breaker fails fast.
    async fn navigate_with_fallback(
        &self,
        page: &Arc<dyn crate::browser::PageHandle>,
        url: &str,
        budget: Duration,
    ) -> Result<(), ScreenshotError> {
        let domain = extract_domain(url).unwrap_or_else(|| "unknown".to_string());
        let manager = self.retry_manager_for(&domain);

        let result = manager
            .execute("navigate", || async {
                let mut last_timeout = None;
                for (wait_until, fraction) in NAV_STRATEGIES {
                    let deadline = Duration::from_secs_f64(budget.as_secs_f64() * fraction);
                    match page.navigate(url, *wait_until, deadline).await {
                        Ok(()) => return Ok(true),
                        Err(e) if is_nav_timeout(&e) => {
                            debug!(url, strategy = %wait_until, "navigation milestone timed out");
                            last_timeout = Some(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                // Every milestone timed out; capture whatever rendered
                if let Some(e) = last_timeout {
                    warn!(url, error = %e, "all navigation strategies timed out, capturing partial page");
                }
                Ok(false)
            })
            .await;

        result.map(|_| ())
    }

    fn retry_manager_for(&self, domain: &str) -> Arc<RetryManager> {
        self.retry_managers
            .entry(domain.to_string())
            .or_insert_with(|| {
                let snapshot = self.settings.snapshot();
                Arc::new(RetryManager::new(
                    format!("capture.{domain}"),
                    RetryConfig::from(&snapshot.retry),
                    Some(self.breakers.for_domain(domain)),
                ))
            })
            .clone()
    }

    /// Delete capture artifacts older than the retention window.
    pub async fn sweep_artifacts(&self) -> usize {
        let retention =
            Duration::from_secs(self.settings.snapshot().temp_file_retention_hours * 3600);
        let mut removed = 0usize;

        let Ok(mut entries) = tokio::fs::read_dir(&self.screenshot_dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO);
            if age > retention {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "swept expired capture artifacts");
        }
        removed
    }

    fn spawn_artifact_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_artifacts().await;
            }
        })
    }

    /// Drop cached results for one URL, or everything when `url` is None.
    /// Returns the number of entries removed.
    pub async fn invalidate_cache(&self, url: Option<&str>) -> usize {
        self.result_cache.invalidate(url).await
    }

    pub async fn cache_stats(
        &self,
    ) -> (
        crate::cache::ResultCacheStats,
        crate::content_cache::ContentCacheStats,
    ) {
        (self.result_cache.stats().await, self.content_cache.stats())
    }

    pub fn throttle_stats(&self) -> crate::throttle::ThrottleStats {
        self.throttle.stats()
    }

    pub async fn tab_stats(&self) -> Option<crate::tab_pool::TabPoolStats> {
        match &self.tab_pool {
            Some(tab_pool) => Some(tab_pool.stats().await),
            None => None,
        }
    }

    /// Retry statistics per target domain.
    pub fn retry_stats(&self) -> Vec<(String, crate::retry::RetryStatsSnapshot)> {
        self.retry_managers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Shutdown in dependency order; every step logs and swallows its own
    /// errors.
    pub async fn shutdown(&self) {
        info!("shutting down screenshot service");
        self.shutting_down.store(true, Ordering::Relaxed);

        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(tab_pool) = &self.tab_pool {
            tab_pool.shutdown().await;
        }
        self.browser_pool.shutdown().await;
        info!("screenshot service shutdown complete");
    }
}

fn is_nav_timeout(error: &ScreenshotError) -> bool {
    match error {
        ScreenshotError::Timeout(_) => true,
        ScreenshotError::Navigation { reason, .. } => reason.to_lowercase().contains("timeout"),
        _ => false,
    }
}

fn is_complex_site(url: &str) -> bool {
    let lower = url.to_lowercase();
    COMPLEX_SITE_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn is_visual_site(url: &str) -> bool {
    let lower = url.to_lowercase();
    VISUAL_SITE_KEYWORDS.iter().any(|k| lower.contains(k))
}
