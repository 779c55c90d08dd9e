//! Abstract browser capabilities
//!
//! The pools and the pipeline never talk to an automation library
//! directly; they hold these traits. The bundled chromiumoxide driver
//! lives in `chromium`, and tests substitute scripted doubles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BrowserEngine, ImageFormat, Settings};
use crate::error::ScreenshotError;

/// Page-load milestones a navigation can wait for, ordered from cheapest
/// to most complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// Navigation committed, nothing rendered yet
    Commit,
    DomContentLoaded,
    NetworkIdle,
    Load,
}

impl std::fmt::Display for WaitUntil {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitUntil::Commit => write!(f, "commit"),
            WaitUntil::DomContentLoaded => write!(f, "domcontentloaded"),
            WaitUntil::NetworkIdle => write!(f, "networkidle"),
            WaitUntil::Load => write!(f, "load"),
        }
    }
}

/// Coarse resource classification of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Document,
    Stylesheet,
    Script,
    Font,
    Image,
    Media,
    Fetch,
    WebSocket,
    Other,
}

/// An intercepted sub-resource request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub url: String,
    pub method: String,
    pub resource_type: ResourceClass,
}

/// What a route handler wants done with an intercepted request.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Let the request go upstream
    Continue,
    /// Drop the request
    Abort,
    /// Answer from local data without touching the network
    Fulfill {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
}

/// Hook invoked for every interceptable request on a page.
///
/// `on_request` runs before the request leaves; `on_response` observes
/// upstream response bodies for requests that continued.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn on_request(&self, request: &RouteRequest) -> RouteDecision;

    /// Whether this handler wants the upstream response body for the
    /// request. Drivers skip body retrieval when no handler does.
    fn wants_response(&self, _request: &RouteRequest) -> bool {
        false
    }

    async fn on_response(&self, _url: &str, _headers: &HashMap<String, String>, _body: &[u8]) {}
}

/// Chains handlers: the first non-`Continue` decision wins, and response
/// observation fans out to every handler.
pub struct RouteHandlerChain {
    handlers: Vec<Arc<dyn RouteHandler>>,
}

impl RouteHandlerChain {
    pub fn new(handlers: Vec<Arc<dyn RouteHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl RouteHandler for RouteHandlerChain {
    async fn on_request(&self, request: &RouteRequest) -> RouteDecision {
        for handler in &self.handlers {
            match handler.on_request(request).await {
                RouteDecision::Continue => continue,
                decision => return decision,
            }
        }
        RouteDecision::Continue
    }

    fn wants_response(&self, request: &RouteRequest) -> bool {
        self.handlers.iter().any(|h| h.wants_response(request))
    }

    async fn on_response(&self, url: &str, headers: &HashMap<String, String>, body: &[u8]) {
        for handler in &self.handlers {
            handler.on_response(url, headers, body).await;
        }
    }
}

/// Options for a context created through the pool.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub user_agent: Option<String>,
}

/// One renderable document; the unit of capture.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), ScreenshotError>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), ScreenshotError>;

    /// Navigate and wait for the requested milestone within `timeout`.
    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(), ScreenshotError>;

    /// Capture the viewport as encoded image bytes.
    async fn capture(&self, format: ImageFormat) -> Result<Vec<u8>, ScreenshotError>;

    /// Install a request interceptor; replaces any previous handler.
    async fn install_route_handler(
        &self,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<(), ScreenshotError>;

    /// Remove interceptors so the page can be pooled for reuse.
    async fn clear_route_handlers(&self) -> Result<(), ScreenshotError>;

    /// Navigate to a blank document, clearing page state for reuse.
    async fn reset(&self, timeout: Duration) -> Result<(), ScreenshotError>;

    async fn close(&self) -> Result<(), ScreenshotError>;

    fn is_closed(&self) -> bool;
}

/// Isolated page-spawning scope inside a browser process.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, ScreenshotError>;

    async fn close(&self) -> Result<(), ScreenshotError>;
}

/// One live browser process.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn BrowserContext>, ScreenshotError>;

    /// False once the underlying process has died or disconnected.
    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), ScreenshotError>;
}

/// Launches browser processes for the pool.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(
        &self,
        engine: BrowserEngine,
        instance_id: usize,
        settings: &Settings,
    ) -> Result<Arc<dyn BrowserHandle>, ScreenshotError>;
}

/// Scripted in-memory driver used across the crate's tests.
///
/// Pages record navigations, can be told to fail or stall, and replay a
/// set of sub-resource fetches through the installed route handler so
/// interception logic is exercised without a real browser.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    use crate::config::Settings;

    #[derive(Default)]
    pub struct DriverScript {
        pub launches: AtomicUsize,
        /// Launches at or beyond this index fail
        pub max_launches: Option<usize>,
        /// Remaining navigations that fail, regardless of URL
        pub nav_failures: AtomicUsize,
        /// Failure text used for scripted navigation errors
        pub nav_failure_reason: StdMutex<String>,
        /// URLs whose navigations always fail
        pub failing_urls: StdMutex<std::collections::HashSet<String>>,
        /// Simulated page-load latency
        pub nav_delay: StdMutex<Duration>,
        pub navigations: StdMutex<Vec<String>>,
        /// Remaining captures that fail
        pub capture_failures: AtomicUsize,
        pub captures: AtomicUsize,
        pub handlers_installed: AtomicUsize,
        /// (url, body) pairs fetched through the route handler per navigation
        pub subresources: StdMutex<Vec<(String, Vec<u8>)>>,
        /// Sub-resource requests answered locally by a handler
        pub fulfilled_from_cache: AtomicUsize,
        /// Sub-resource requests that went upstream
        pub fetched_upstream: AtomicUsize,
    }

    impl DriverScript {
        pub fn new() -> Arc<Self> {
            let script = Self::default();
            *script.nav_failure_reason.lock().unwrap() = "connection refused".to_string();
            Arc::new(script)
        }

        pub fn fail_url(&self, url: &str) {
            self.failing_urls.lock().unwrap().insert(url.to_string());
        }

        pub fn navigated_urls(&self) -> Vec<String> {
            self.navigations.lock().unwrap().clone()
        }
    }

    pub struct ScriptedFactory {
        pub script: Arc<DriverScript>,
    }

    impl ScriptedFactory {
        pub fn new(script: Arc<DriverScript>) -> Arc<Self> {
            Arc::new(Self { script })
        }

        pub fn fresh() -> Arc<Self> {
            Self::new(DriverScript::new())
        }
    }

    #[async_trait]
    impl BrowserFactory for ScriptedFactory {
        async fn launch(
            &self,
            _engine: crate::config::BrowserEngine,
            _instance_id: usize,
            _settings: &Settings,
        ) -> Result<Arc<dyn BrowserHandle>, ScreenshotError> {
            let n = self.script.launches.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.script.max_launches {
                if n >= limit {
                    return Err(ScreenshotError::BrowserLaunchFailed(
                        "scripted launch limit".into(),
                    ));
                }
            }
            Ok(Arc::new(ScriptedBrowser {
                script: self.script.clone(),
                connected: AtomicBool::new(true),
            }))
        }
    }

    pub struct ScriptedBrowser {
        script: Arc<DriverScript>,
        connected: AtomicBool,
    }

    #[async_trait]
    impl BrowserHandle for ScriptedBrowser {
        async fn new_context(
            &self,
            _options: &ContextOptions,
        ) -> Result<Arc<dyn BrowserContext>, ScreenshotError> {
            Ok(Arc::new(ScriptedContext {
                script: self.script.clone(),
            }))
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        async fn close(&self) -> Result<(), ScreenshotError> {
            self.connected.store(false, Ordering::Relaxed);
            Ok(())
        }
    }

    pub struct ScriptedContext {
        script: Arc<DriverScript>,
    }

    #[async_trait]
    impl BrowserContext for ScriptedContext {
        async fn new_page(&self) -> Result<Arc<dyn PageHandle>, ScreenshotError> {
            Ok(Arc::new(ScriptedPage {
                script: self.script.clone(),
                closed: AtomicBool::new(false),
                handler: Mutex::new(None),
            }))
        }

        async fn close(&self) -> Result<(), ScreenshotError> {
            Ok(())
        }
    }

    pub struct ScriptedPage {
        script: Arc<DriverScript>,
        closed: AtomicBool,
        handler: Mutex<Option<Arc<dyn RouteHandler>>>,
    }

    #[async_trait]
    impl PageHandle for ScriptedPage {
        async fn set_viewport(&self, _width: u32, _height: u32) -> Result<(), ScreenshotError> {
            Ok(())
        }

        async fn set_user_agent(&self, _user_agent: &str) -> Result<(), ScreenshotError> {
            Ok(())
        }

        async fn navigate(
            &self,
            url: &str,
            _wait_until: WaitUntil,
            _timeout: Duration,
        ) -> Result<(), ScreenshotError> {
            self.script
                .navigations
                .lock()
                .unwrap()
                .push(url.to_string());

            let reason = self.script.nav_failure_reason.lock().unwrap().clone();
            if self.script.failing_urls.lock().unwrap().contains(url) {
                return Err(ScreenshotError::Navigation {
                    url: url.to_string(),
                    reason,
                });
            }
            let remaining = self.script.nav_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.script.nav_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ScreenshotError::Navigation {
                    url: url.to_string(),
                    reason,
                });
            }

            let delay = *self.script.nav_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // Replay scripted sub-resource fetches through the handler
            let handler = self.handler.lock().await.clone();
            if let Some(handler) = handler {
                let subresources = self.script.subresources.lock().unwrap().clone();
                for (sub_url, body) in subresources {
                    let request = RouteRequest {
                        url: sub_url.clone(),
                        method: "GET".into(),
                        resource_type: ResourceClass::Script,
                    };
                    match handler.on_request(&request).await {
                        RouteDecision::Fulfill { .. } => {
                            self.script.fulfilled_from_cache.fetch_add(1, Ordering::SeqCst);
                        }
                        RouteDecision::Abort => {}
                        RouteDecision::Continue => {
                            self.script.fetched_upstream.fetch_add(1, Ordering::SeqCst);
                            if handler.wants_response(&request) {
                                let headers = HashMap::new();
                                handler.on_response(&sub_url, &headers, &body).await;
                            }
                        }
                    }
                }
            }
            Ok(())
        }

        async fn capture(&self, _format: ImageFormat) -> Result<Vec<u8>, ScreenshotError> {
            let remaining = self.script.capture_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.script
                    .capture_failures
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(ScreenshotError::CaptureFailed("scripted failure".into()));
            }
            self.script.captures.fetch_add(1, Ordering::SeqCst);
            Ok(b"\x89PNG\r\n\x1a\nscripted".to_vec())
        }

        async fn install_route_handler(
            &self,
            handler: Arc<dyn RouteHandler>,
        ) -> Result<(), ScreenshotError> {
            self.script.handlers_installed.fetch_add(1, Ordering::SeqCst);
            *self.handler.lock().await = Some(handler);
            Ok(())
        }

        async fn clear_route_handlers(&self) -> Result<(), ScreenshotError> {
            *self.handler.lock().await = None;
            Ok(())
        }

        async fn reset(&self, _timeout: Duration) -> Result<(), ScreenshotError> {
            *self.handler.lock().await = None;
            Ok(())
        }

        async fn close(&self) -> Result<(), ScreenshotError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(RouteDecision);

    #[async_trait]
    impl RouteHandler for Always {
        async fn on_request(&self, _request: &RouteRequest) -> RouteDecision {
            self.0.clone()
        }
    }

    fn request() -> RouteRequest {
        RouteRequest {
            url: "https://example.com/app.js".into(),
            method: "GET".into(),
            resource_type: ResourceClass::Script,
        }
    }

    #[tokio::test]
    async fn chain_first_decision_wins() {
        let chain = RouteHandlerChain::new(vec![
            Arc::new(Always(RouteDecision::Continue)) as Arc<dyn RouteHandler>,
            Arc::new(Always(RouteDecision::Abort)),
            Arc::new(Always(RouteDecision::Fulfill {
                status: 200,
                headers: HashMap::new(),
                body: vec![1],
            })),
        ]);
        assert!(matches!(
            chain.on_request(&request()).await,
            RouteDecision::Abort
        ));
    }

    #[tokio::test]
    async fn empty_chain_continues() {
        let chain = RouteHandlerChain::new(Vec::new());
        assert!(matches!(
            chain.on_request(&request()).await,
            RouteDecision::Continue
        ));
    }
}
