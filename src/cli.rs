//! Command-line interface
//!
//! Wires the full service stack (pool, tab pool, caches, batch engine,
//! watchdog, metrics) and drives it from the terminal: one-shot captures,
//! file-driven batches and a stats dump.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::fs;
use tracing::{info, warn};

use crate::batch::{BatchItem, BatchService};
use crate::chromium::ChromiumFactory;
use crate::browser_pool::BrowserPool;
use crate::config::{CaptureRequest, ImageFormat, Settings, SharedSettings};
use crate::error::ScreenshotError;
use crate::health::HealthChecker;
use crate::job::{BatchConfig, JobPriority, JobStore};
use crate::metrics::MetricsCollector;
use crate::screenshot_service::ScreenshotService;
use crate::storage::{
    LocalObjectStore, MappingUrlRewriter, ProxyUrlSigner, StorageCollaborators,
};
use crate::tab_pool::TabPool;
use crate::watchdog::{PoolWatchdog, RequestActivity};

#[derive(Parser)]
#[command(name = "pagesnap")]
#[command(about = "Headless-browser screenshot service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Minimum browser pool size")]
    pub pool_min: Option<usize>,

    #[arg(long, help = "Maximum browser pool size")]
    pub pool_max: Option<usize>,

    #[arg(long, help = "Screenshot output directory")]
    pub screenshot_dir: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Browser executable path")]
    pub browser_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a single URL
    Single {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(long, default_value = "1280", help = "Viewport width")]
        width: u32,

        #[arg(long, default_value = "720", help = "Viewport height")]
        height: u32,

        #[arg(long, default_value = "png", help = "Output format (png, jpeg, webp)")]
        format: String,

        #[arg(long, help = "Bypass the result cache")]
        no_cache: bool,
    },

    /// Run a batch from a file of URLs (one per line)
    Batch {
        #[arg(short, long, help = "Input file containing URLs")]
        input: PathBuf,

        #[arg(long, default_value = "3", help = "Items processed in parallel (1-10)")]
        parallel: usize,

        #[arg(long, default_value = "30", help = "Per-item timeout in seconds (5-60)")]
        timeout: u64,

        #[arg(long, help = "Cancel remaining items on first failure")]
        fail_fast: bool,

        #[arg(long, default_value = "normal", help = "Job priority (high, normal, low)")]
        priority: String,

        #[arg(long, help = "Webhook URL notified when the job finishes")]
        webhook: Option<String>,

        #[arg(long, default_value = "1280", help = "Viewport width")]
        width: u32,

        #[arg(long, default_value = "720", help = "Viewport height")]
        height: u32,

        #[arg(long, default_value = "png", help = "Output format")]
        format: String,
    },

    /// Print a metrics snapshot after warming the stack
    Stats,
}

/// The wired service stack.
pub struct CliRunner {
    pub settings: SharedSettings,
    pub service: Arc<ScreenshotService>,
    pub batch: Arc<BatchService>,
    pub metrics: Arc<MetricsCollector>,
    pub health: Arc<HealthChecker>,
    watchdog_task: Option<tokio::task::JoinHandle<()>>,
    health_task: Option<tokio::task::JoinHandle<()>>,
}

impl CliRunner {
    /// Build every service against the chromium driver.
    pub async fn new(settings: Settings) -> Result<Self, ScreenshotError> {
        settings.validate()?;
        let shared = SharedSettings::new(settings.clone());

        let metrics = MetricsCollector::new();
        let activity = RequestActivity::new();

        let pool = BrowserPool::new(shared.clone(), Arc::new(ChromiumFactory::new())).await?;
        let tab_pool = if settings.tabs.enabled {
            Some(TabPool::new(shared.clone()))
        } else {
            None
        };

        let storage = StorageCollaborators {
            object_store: Arc::new(LocalObjectStore::new(
                PathBuf::from(&settings.screenshot_dir).join("store"),
            )),
            signer: Arc::new(ProxyUrlSigner::new(
                std::env::var("PAGESNAP_SIGN_BASE")
                    .unwrap_or_else(|_| "http://127.0.0.1:8080/img".to_string()),
                std::env::var("PAGESNAP_SIGN_SECRET").unwrap_or_else(|_| "dev-secret".to_string()),
            )),
            rewriter: Arc::new(MappingUrlRewriter::identity()),
        };

        let service = ScreenshotService::new(
            shared.clone(),
            pool.clone(),
            tab_pool,
            storage,
            metrics.clone(),
            activity.clone(),
        )
        .await?;

        let store = Arc::new(JobStore::new(settings.batch.max_jobs, settings.batch.job_ttl));
        let batch = BatchService::new(shared.clone(), store, service.clone());
        batch.start().await;

        let watchdog_task = if settings.watchdog.enabled {
            let watchdog = PoolWatchdog::new(shared.clone(), pool, activity);
            Some(watchdog.spawn())
        } else {
            None
        };

        let health = HealthChecker::new(shared.clone());
        let health_task = if settings.health.enabled {
            Some(health.spawn())
        } else {
            None
        };

        Ok(Self {
            settings: shared,
            service,
            batch,
            metrics,
            health,
            watchdog_task,
            health_task,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<(), ScreenshotError> {
        match command {
            Commands::Single {
                url,
                width,
                height,
                format,
                no_cache,
            } => self.run_single(url, width, height, &format, no_cache).await,
            Commands::Batch {
                input,
                parallel,
                timeout,
                fail_fast,
                priority,
                webhook,
                width,
                height,
                format,
            } => {
                self.run_batch(
                    input, parallel, timeout, fail_fast, &priority, webhook, width, height,
                    &format,
                )
                .await
            }
            Commands::Stats => {
                // Push the latest snapshots into the collector first
                let (result_stats, content_stats) = self.service.cache_stats().await;
                self.metrics
                    .update_cache_stats(result_stats, content_stats)
                    .await;
                self.metrics
                    .update_throttle_stats(self.service.throttle_stats())
                    .await;
                if let Some(tabs) = self.service.tab_stats().await {
                    self.metrics.update_tab_stats(tabs).await;
                }
                for (domain, stats) in self.service.retry_stats() {
                    self.metrics.update_retry_stats(&domain, stats).await;
                }

                let snapshot = self.metrics.get_metrics().await;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                let content = self.service.content_cache.stats();
                println!(
                    "content cache: {} entries, {}",
                    content.entries,
                    crate::utils::format_bytes(content.total_size)
                );
                println!("health: {}", serde_json::to_string(&self.health.stats())?);
                println!("batch: {}", serde_json::to_string(&self.batch.stats().await)?);
                Ok(())
            }
        }
    }

    async fn run_single(
        &self,
        url: String,
        width: u32,
        height: u32,
        format: &str,
        no_cache: bool,
    ) -> Result<(), ScreenshotError> {
        let mut request = CaptureRequest::new(url, width, height, ImageFormat::parse(format)?);
        request.use_cache = !no_cache;

        let outcome = self.service.capture(request).await?;
        println!("{}", outcome.url);
        info!(
            cached = outcome.cached,
            duration = %crate::utils::format_duration(Duration::from_millis(outcome.duration_ms)),
            "capture finished"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        input: PathBuf,
        parallel: usize,
        timeout: u64,
        fail_fast: bool,
        priority: &str,
        webhook: Option<String>,
        width: u32,
        height: u32,
        format: &str,
    ) -> Result<(), ScreenshotError> {
        let format = ImageFormat::parse(format)?;
        let priority = match priority.to_ascii_lowercase().as_str() {
            "high" => JobPriority::High,
            "normal" => JobPriority::Normal,
            "low" => JobPriority::Low,
            other => {
                return Err(ScreenshotError::InvalidInput(format!(
                    "unknown priority '{other}'"
                )))
            }
        };

        let content = fs::read_to_string(&input).await?;
        let items: Vec<BatchItem> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .enumerate()
            .map(|(index, url)| BatchItem {
                id: format!("item-{}", index + 1),
                request: CaptureRequest::new(url, width, height, format),
            })
            .collect();

        let config = BatchConfig {
            parallel,
            timeout,
            fail_fast,
            priority,
            webhook,
            ..Default::default()
        };

        let snapshot = self.batch.submit(items, config, None).await?;
        info!(job_id = %snapshot.job_id, items = snapshot.counts.total, "batch submitted");

        // Poll until the job goes terminal
        let job_id = snapshot.job_id;
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let Some(current) = self.batch.get_job(&job_id).await else {
                warn!(job_id = %job_id, "job disappeared from the store");
                break;
            };
            if current.status.is_terminal() {
                let results = self
                    .batch
                    .get_job_results(&job_id)
                    .await
                    .expect("terminal job has results");
                println!("{}", serde_json::to_string_pretty(&results)?);
                info!(
                    job_id,
                    succeeded = results.succeeded,
                    failed = results.failed,
                    "batch finished"
                );
                break;
            }
        }
        Ok(())
    }

    /// Shutdown order: admission first, pools last, metrics flushed at
    /// the end.
    pub async fn shutdown(&self) {
        self.batch.shutdown().await;
        if let Some(task) = &self.watchdog_task {
            task.abort();
        }
        if let Some(task) = &self.health_task {
            task.abort();
        }
        self.service.shutdown().await;
        self.metrics.flush().await;
    }
}
