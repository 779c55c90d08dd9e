//! # pagesnap
//!
//! A headless-browser screenshot service: given a URL and viewport, it
//! drives a pooled browser engine to render the page, captures an image,
//! stores the artifact and returns a signed image-transform URL. The
//! crate is built to sustain thousands of concurrent capture requests
//! against a small pool of expensive browser processes.
//!
//! ## Architecture
//!
//! - **Browser pool** — lifecycle-managed browser processes with
//!   health/age-based recycling, proactive scaling and bounded waiting.
//! - **Tab pool** — page reuse within each browser process to multiply
//!   effective capacity.
//! - **Request pipeline** — admission throttle, result cache, content
//!   cache with route interception, progressive-fallback navigation, and
//!   a retry engine with per-domain circuit breakers.
//! - **Batch engine** — priority-scheduled, recurring, webhook-notified
//!   batch jobs with per-user token-bucket rate limiting.
//! - **Watchdog & health** — stuck-pool recovery and periodic
//!   self-probes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagesnap::{
//!     BrowserPool, CaptureRequest, ChromiumFactory, ImageFormat, LocalObjectStore,
//!     MappingUrlRewriter, MetricsCollector, ProxyUrlSigner, RequestActivity,
//!     ScreenshotService, Settings, SharedSettings, StorageCollaborators, TabPool,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = SharedSettings::new(Settings::default());
//!     let pool = BrowserPool::new(settings.clone(), Arc::new(ChromiumFactory::new())).await?;
//!     let tabs = TabPool::new(settings.clone());
//!     let storage = StorageCollaborators {
//!         object_store: Arc::new(LocalObjectStore::new("screenshots/store")),
//!         signer: Arc::new(ProxyUrlSigner::new("http://127.0.0.1:8080/img", "secret")),
//!         rewriter: Arc::new(MappingUrlRewriter::identity()),
//!     };
//!     let service = ScreenshotService::new(
//!         settings,
//!         pool,
//!         Some(tabs),
//!         storage,
//!         MetricsCollector::new(),
//!         RequestActivity::new(),
//!     )
//!     .await?;
//!
//!     let outcome = service
//!         .capture(CaptureRequest::new("https://example.com", 1280, 720, ImageFormat::Png))
//!         .await?;
//!     println!("signed url: {}", outcome.url);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Configuration tree and the reloadable settings handle
pub mod config;

/// Error taxonomy and API error-code mapping
pub mod error;

/// Retry engine and per-domain circuit breakers
pub mod retry;

/// Token-bucket rate limiting for batch admission
pub mod rate_limit;

/// Bounded-concurrency admission throttle
pub mod throttle;

/// Result cache (request fingerprint → signed URL)
pub mod cache;

/// On-disk sub-resource cache with route interception
pub mod content_cache;

/// Abstract browser/context/page capabilities
pub mod browser;

/// chromiumoxide-backed browser driver
pub mod chromium;

/// Browser process pool
pub mod browser_pool;

/// Tab pool layered on the browser pool
pub mod tab_pool;

/// Capture pipeline
pub mod screenshot_service;

/// Batch job model, queues and job store
pub mod job;

/// Batch engine: scheduler, workers, webhooks
pub mod batch;

/// Pool watchdog for stuck-browser recovery
pub mod watchdog;

/// Periodic self-probe health checker
pub mod health;

/// Observability collector
pub mod metrics;

/// Storage collaborators: object store, URL signer, domain rewriter
pub mod storage;

/// URL and formatting helpers
pub mod utils;

/// Command-line interface
pub mod cli;

#[cfg(test)]
mod tests;

pub use batch::*;
pub use browser::{
    BrowserContext, BrowserFactory, BrowserHandle, ContextOptions, PageHandle, ResourceClass,
    RouteDecision, RouteHandler, RouteHandlerChain, RouteRequest, WaitUntil,
};
pub use browser_pool::*;
pub use cache::*;
pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use content_cache::*;
pub use error::*;
pub use health::*;
pub use job::*;
pub use metrics::*;
pub use rate_limit::*;
pub use retry::*;
pub use screenshot_service::*;
pub use storage::*;
pub use tab_pool::*;
pub use throttle::*;
pub use utils::*;
pub use watchdog::*;
