//! Configuration management with serde serialization/deserialization
//!
//! All tunables for the screenshot service live here, grouped by subsystem:
//! browser pool sizing, tab reuse, throttling, caches, batch processing,
//! watchdog thresholds and navigation timeouts.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::ScreenshotError;

/// Top-level configuration for the screenshot service.
///
/// # Examples
///
/// ```rust
/// use pagesnap::Settings;
///
/// // Use default configuration
/// let settings = Settings::default();
///
/// // Create custom configuration
/// let settings = Settings {
///     pool: pagesnap::PoolSettings {
///         min_size: 2,
///         max_size: 8,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Browser pool sizing and recycling
    pub pool: PoolSettings,

    /// Tab reuse within browser processes
    pub tabs: TabSettings,

    /// Admission control in front of the pipeline
    pub throttle: ThrottleSettings,

    /// Fingerprint → signed-URL result cache
    pub result_cache: ResultCacheSettings,

    /// On-disk sub-resource cache
    pub content_cache: ContentCacheSettings,

    /// Retry behavior for browser operations
    pub retry: RetrySettings,

    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerSettings,

    /// Batch job processing
    pub batch: BatchSettings,

    /// Pool watchdog thresholds
    pub watchdog: WatchdogSettings,

    /// Periodic self-probe
    pub health: HealthSettings,

    /// Operation timeouts
    pub timeouts: TimeoutSettings,

    /// Resource classes aborted during navigation
    pub blocking: BlockingSettings,

    /// Browser engine to launch (the bundled driver serves chromium)
    pub engine: BrowserEngine,

    /// Path to the browser executable (None = auto-detect)
    pub browser_path: Option<String>,

    /// Custom User-Agent header applied to every page
    pub user_agent: Option<String>,

    /// Directory for capture artifacts and the content cache
    pub screenshot_dir: String,

    /// Capture artifacts older than this many hours are swept
    pub temp_file_retention_hours: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            tabs: TabSettings::default(),
            throttle: ThrottleSettings::default(),
            result_cache: ResultCacheSettings::default(),
            content_cache: ContentCacheSettings::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            batch: BatchSettings::default(),
            watchdog: WatchdogSettings::default(),
            health: HealthSettings::default(),
            timeouts: TimeoutSettings::default(),
            blocking: BlockingSettings::default(),
            engine: BrowserEngine::Chromium,
            browser_path: None,
            user_agent: None,
            screenshot_dir: "screenshots".to_string(),
            temp_file_retention_hours: 24,
        }
    }
}

impl Settings {
    /// Validate settings before wiring up the services.
    pub fn validate(&self) -> Result<(), ScreenshotError> {
        if self.pool.min_size == 0 {
            return Err(ScreenshotError::InvalidInput(
                "pool.min_size must be greater than 0".into(),
            ));
        }
        if self.pool.max_size < self.pool.min_size {
            return Err(ScreenshotError::InvalidInput(format!(
                "pool.max_size ({}) must be >= pool.min_size ({})",
                self.pool.max_size, self.pool.min_size
            )));
        }
        if self.tabs.max_tabs_per_browser == 0 {
            return Err(ScreenshotError::InvalidInput(
                "tabs.max_tabs_per_browser must be greater than 0".into(),
            ));
        }
        if self.throttle.max_concurrent == 0 {
            return Err(ScreenshotError::InvalidInput(
                "throttle.max_concurrent must be greater than 0".into(),
            ));
        }
        if self.screenshot_dir.is_empty() {
            return Err(ScreenshotError::InvalidInput(
                "screenshot_dir must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Browser pool sizing and recycling thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Browsers kept alive even when idle
    pub min_size: usize,
    /// Hard ceiling on concurrent browser processes.
    ///
    /// Re-read on every wait-path iteration, so raising it through
    /// [`SharedSettings::update`] takes effect on in-flight acquisitions.
    pub max_size: usize,
    /// Idle browsers beyond min_size are recycled after this
    pub idle_timeout: Duration,
    /// Browsers are recycled once they reach this age
    pub max_age: Duration,
    /// Proactive cleanup scan period
    pub cleanup_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: (num_cpus::get() * 2).clamp(4, 16),
            idle_timeout: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Tab pool behavior layered on top of the browser pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TabSettings {
    /// Whether the tab pool is used at all (fallback: one context per request)
    pub enabled: bool,
    /// Reuse released tabs instead of closing them
    pub reuse: bool,
    pub max_tabs_per_browser: usize,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub cleanup_interval: Duration,
}

impl Default for TabSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reuse: true,
            max_tabs_per_browser: 5,
            idle_timeout: Duration::from_secs(120),
            max_age: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThrottleSettings {
    pub max_concurrent: usize,
    pub queue_size: usize,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 32,
            queue_size: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultCacheSettings {
    pub enabled: bool,
    pub max_items: usize,
    pub ttl: Duration,
}

impl Default for ResultCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_items: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentCacheSettings {
    pub enabled: bool,
    /// Also cache documents, data files and archives, not just page assets
    pub all_content: bool,
    /// Sub-resources larger than this are never persisted
    pub max_file_size: u64,
    /// High-water eviction starts at 80% of this
    pub max_total_size: u64,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
    /// Hosts whose resources are always cacheable
    pub priority_domains: Vec<String>,
}

impl Default for ContentCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            all_content: false,
            max_file_size: 10 * 1024 * 1024,
            max_total_size: 500 * 1024 * 1024,
            ttl: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            priority_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction (0–1) applied to each delay
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the breaker opens
    pub threshold: usize,
    /// Time a tripped breaker stays open before half-open probing
    pub reset_time: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_time: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchSettings {
    /// Jobs retained in the store (terminal jobs evicted first)
    pub max_jobs: usize,
    /// Terminal jobs older than this are evicted
    pub job_ttl: Duration,
    /// Jobs processed concurrently across all users
    pub max_concurrent_jobs: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_jobs: 100,
            job_ttl: Duration::from_secs(3600),
            max_concurrent_jobs: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogSettings {
    pub enabled: bool,
    /// Scan period
    pub interval: Duration,
    /// No requests for this long + high utilization = stuck pool
    pub idle_threshold: Duration,
    /// Utilization fraction above which the stuck check applies
    pub usage_threshold: f64,
    /// Slots older than this are force-recycled regardless of state
    pub force_recycle_age: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(120),
            usage_threshold: 0.7,
            force_recycle_age: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    /// Probed with cache bypass; normally the service's own capture endpoint
    pub probe_url: String,
    /// Grace period before the first probe
    pub startup_delay: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(30),
            probe_url: "http://127.0.0.1:8000/screenshot?url=https://example.com&cache=false"
                .to_string(),
            startup_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    pub navigation: Duration,
    /// Used instead of `navigation` for complex/visual sites
    pub navigation_complex: Duration,
    pub browser_launch: Duration,
    pub context_creation: Duration,
    pub page_creation: Duration,
    pub screenshot: Duration,
    pub webhook: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(30),
            navigation_complex: Duration::from_secs(60),
            browser_launch: Duration::from_secs(60),
            context_creation: Duration::from_secs(30),
            page_creation: Duration::from_secs(10),
            screenshot: Duration::from_secs(30),
            webhook: Duration::from_secs(15),
        }
    }
}

/// Resource classes aborted by the blocking route handler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockingSettings {
    pub block_fonts: bool,
    pub block_media: bool,
    pub block_analytics: bool,
    pub block_ads: bool,
    pub block_social: bool,
    /// Abort everything not on the captured page's host
    pub block_third_party: bool,
}

impl Default for BlockingSettings {
    fn default() -> Self {
        Self {
            block_fonts: false,
            block_media: false,
            block_analytics: true,
            block_ads: true,
            block_social: false,
            block_third_party: false,
        }
    }
}

/// Supported browser engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    Chromium,
    Firefox,
    Webkit,
}

impl std::fmt::Display for BrowserEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserEngine::Chromium => write!(f, "chromium"),
            BrowserEngine::Firefox => write!(f, "firefox"),
            BrowserEngine::Webkit => write!(f, "webkit"),
        }
    }
}

/// Output image formats.
///
/// The engine captures PNG and JPEG natively; WebP is converted from the
/// captured PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ScreenshotError> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(ScreenshotError::InvalidInput(format!(
                "unsupported image format: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_format() -> ImageFormat {
    ImageFormat::Png
}
fn default_use_cache() -> bool {
    true
}

/// One screenshot request as accepted by the pipeline.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureRequest {
    pub url: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_format")]
    pub format: ImageFormat,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

impl CaptureRequest {
    pub fn new(url: impl Into<String>, width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            url: url.into(),
            width,
            height,
            format,
            use_cache: true,
        }
    }

    /// Validate against the accepted viewport envelope.
    pub fn validate(&self) -> Result<(), ScreenshotError> {
        crate::utils::validate_url(&self.url)
            .map_err(|e| ScreenshotError::InvalidInput(format!("invalid url: {e}")))?;
        if self.width == 0 || self.width > 3840 {
            return Err(ScreenshotError::InvalidInput(format!(
                "width {} out of range 1-3840",
                self.width
            )));
        }
        if self.height == 0 || self.height > 2160 {
            return Err(ScreenshotError::InvalidInput(format!(
                "height {} out of range 1-2160",
                self.height
            )));
        }
        Ok(())
    }
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            width: 1280,
            height: 720,
            format: ImageFormat::Png,
            use_cache: true,
        }
    }
}

/// Atomically-readable settings handle.
///
/// The pool re-reads `pool.max_size` through this during waits, so an
/// operator can raise the ceiling without restarting the service.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy-out snapshot of the current settings.
    pub fn snapshot(&self) -> Settings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Current pool ceiling without cloning the whole tree.
    pub fn pool_max_size(&self) -> usize {
        self.inner.read().expect("settings lock poisoned").pool.max_size
    }

    /// Apply a mutation to the live settings.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut guard = self.inner.write().expect("settings lock poisoned");
        f(&mut guard);
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl std::fmt::Debug for SharedSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSettings").finish_non_exhaustive()
    }
}

/// Generate browser command-line arguments for a pooled instance.
///
/// Each instance gets unique user-data and debugging endpoints to avoid
/// singleton conflicts when several processes launch concurrently.
pub fn chromium_args(settings: &Settings, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--mute-audio".to_string(),
        "--disable-notifications".to_string(),
        "--disable-popup-blocking".to_string(),
        "--memory-pressure-off".to_string(),
        format!("--user-data-dir=/tmp/pagesnap-profile-{unique_id}"),
    ];

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.pool.max_size >= settings.pool.min_size);
    }

    #[test]
    fn validation_rejects_zero_pool() {
        let mut settings = Settings::default();
        settings.pool.min_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn request_viewport_bounds() {
        let mut req = CaptureRequest::new("https://example.com", 1280, 720, ImageFormat::Png);
        assert!(req.validate().is_ok());

        req.width = 0;
        assert!(req.validate().is_err());
        req.width = 3841;
        assert!(req.validate().is_err());
        req.width = 3840;
        req.height = 2161;
        assert!(req.validate().is_err());
        req.height = 2160;
        assert!(req.validate().is_ok());

        req.url = "not-a-url".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn image_format_parsing() {
        assert_eq!(ImageFormat::parse("png").unwrap(), ImageFormat::Png);
        assert_eq!(ImageFormat::parse("JPG").unwrap(), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::parse("webp").unwrap(), ImageFormat::Webp);
        assert!(ImageFormat::parse("tiff").is_err());
    }

    #[test]
    fn shared_settings_reload_visible() {
        let shared = SharedSettings::default();
        let before = shared.pool_max_size();
        shared.update(|s| s.pool.max_size = before + 4);
        assert_eq!(shared.pool_max_size(), before + 4);
    }

    #[test]
    fn chromium_args_include_unique_profile() {
        let settings = Settings::default();
        let a = chromium_args(&settings, 0);
        let b = chromium_args(&settings, 1);
        assert!(a.contains(&"--headless".to_string()));
        assert!(a.iter().any(|arg| arg.starts_with("--user-data-dir=")));
        assert_ne!(
            a.iter().find(|arg| arg.starts_with("--user-data-dir=")),
            b.iter().find(|arg| arg.starts_with("--user-data-dir="))
        );
    }
}
