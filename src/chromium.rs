//! chromiumoxide-backed implementation of the browser capabilities
//!
//! One `ChromiumBrowser` owns a headless Chrome process plus the task
//! polling its DevTools Protocol handler stream. Route interception is
//! wired through the CDP `Fetch` domain with both request- and
//! response-stage patterns so cache hits can be fulfilled locally and
//! misses observed as their bodies arrive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    GetResponseBodyParams, HeaderEntry, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::browser::{
    BrowserContext, BrowserFactory, BrowserHandle, ContextOptions, PageHandle, ResourceClass,
    RouteDecision, RouteHandler, RouteRequest, WaitUntil,
};
use crate::config::{chromium_args, BrowserEngine, ImageFormat, Settings};
use crate::error::ScreenshotError;

fn classify_resource(resource_type: &ResourceType) -> ResourceClass {
    match resource_type {
        ResourceType::Document => ResourceClass::Document,
        ResourceType::Stylesheet => ResourceClass::Stylesheet,
        ResourceType::Script => ResourceClass::Script,
        ResourceType::Font => ResourceClass::Font,
        ResourceType::Image => ResourceClass::Image,
        ResourceType::Media => ResourceClass::Media,
        ResourceType::Xhr | ResourceType::Fetch => ResourceClass::Fetch,
        ResourceType::WebSocket => ResourceClass::WebSocket,
        _ => ResourceClass::Other,
    }
}

/// Launches pooled Chrome processes.
pub struct ChromiumFactory;

impl ChromiumFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ChromiumFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserFactory for ChromiumFactory {
    async fn launch(
        &self,
        engine: BrowserEngine,
        instance_id: usize,
        settings: &Settings,
    ) -> Result<Arc<dyn BrowserHandle>, ScreenshotError> {
        if engine != BrowserEngine::Chromium {
            return Err(ScreenshotError::Browser(format!(
                "engine {engine} is not served by the chromium driver"
            )));
        }

        let mut builder = BrowserConfig::builder().args(chromium_args(settings, instance_id));
        if let Some(path) = &settings.browser_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(ScreenshotError::BrowserLaunchFailed)?;

        let (browser, mut handler) = timeout(settings.timeouts.browser_launch, Browser::launch(config))
            .await
            .map_err(|_| {
                ScreenshotError::BrowserLaunchFailed(format!(
                    "launch timed out after {:?}",
                    settings.timeouts.browser_launch
                ))
            })?
            .map_err(|e| ScreenshotError::BrowserLaunchFailed(e.to_string()))?;

        let connected = Arc::new(AtomicBool::new(true));
        let connected_flag = connected.clone();

        // The handler implements Stream and must be polled continuously to
        // drive DevTools Protocol traffic for this process
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!(error = %e, "browser handler error");
                    break;
                }
            }
            connected_flag.store(false, Ordering::Relaxed);
            info!("browser handler stream ended");
        });

        info!(instance_id, "chromium instance launched");

        Ok(Arc::new(ChromiumBrowser {
            browser: Arc::new(Mutex::new(browser)),
            handler_task,
            connected,
        }))
    }
}

pub struct ChromiumBrowser {
    browser: Arc<Mutex<Browser>>,
    handler_task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn BrowserContext>, ScreenshotError> {
        Ok(Arc::new(ChromiumContext {
            browser: self.browser.clone(),
            user_agent: options.user_agent.clone(),
            pages: Mutex::new(Vec::new()),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.handler_task.is_finished()
    }

    async fn close(&self) -> Result<(), ScreenshotError> {
        let result = self.browser.lock().await.close().await;
        self.handler_task.abort();
        self.connected.store(false, Ordering::Relaxed);
        result
            .map(|_| ())
            .map_err(|e| ScreenshotError::Browser(e.to_string()))
    }
}

/// Page-spawning scope within one browser process.
///
/// Chrome's DevTools protocol shares cookie storage across pages of one
/// process; isolation between captures comes from resetting page state,
/// which is the same trade the tab pool already makes.
pub struct ChromiumContext {
    browser: Arc<Mutex<Browser>>,
    user_agent: Option<String>,
    pages: Mutex<Vec<Arc<ChromiumPage>>>,
}

#[async_trait]
impl BrowserContext for ChromiumContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, ScreenshotError> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| ScreenshotError::Browser(format!("new page: {e}")))?
        };

        let page = Arc::new(ChromiumPage {
            page,
            interceptor: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if let Some(user_agent) = &self.user_agent {
            page.set_user_agent(user_agent).await?;
        }

        self.pages.lock().await.push(page.clone());
        Ok(page)
    }

    async fn close(&self) -> Result<(), ScreenshotError> {
        let pages = std::mem::take(&mut *self.pages.lock().await);
        for page in pages {
            if !page.is_closed() {
                if let Err(e) = page.close().await {
                    warn!(error = %e, "closing context page failed");
                }
            }
        }
        Ok(())
    }
}

pub struct ChromiumPage {
    page: Page,
    interceptor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChromiumPage {
    fn err_browser(e: impl std::fmt::Display) -> ScreenshotError {
        ScreenshotError::Browser(e.to_string())
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), ScreenshotError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(Self::err_browser)?;
        self.page
            .execute(params)
            .await
            .map_err(Self::err_browser)?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), ScreenshotError> {
        let params = SetUserAgentOverrideParams::builder()
            .user_agent(user_agent)
            .build()
            .map_err(Self::err_browser)?;
        self.page
            .execute(params)
            .await
            .map_err(Self::err_browser)?;
        Ok(())
    }

    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        deadline: Duration,
    ) -> Result<(), ScreenshotError> {
        let nav = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| ScreenshotError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            // The protocol signals a single load lifecycle; the cheaper
            // milestones return right after the navigation response
            if matches!(wait_until, WaitUntil::Load | WaitUntil::NetworkIdle) {
                self.page
                    .wait_for_navigation()
                    .await
                    .map_err(|e| ScreenshotError::Navigation {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            Ok(())
        };

        match timeout(deadline, nav).await {
            Ok(result) => result,
            Err(_) => Err(ScreenshotError::Navigation {
                url: url.to_string(),
                reason: format!("{wait_until} timeout after {deadline:?}"),
            }),
        }
    }

    async fn capture(&self, format: ImageFormat) -> Result<Vec<u8>, ScreenshotError> {
        let cdp_format = match format {
            ImageFormat::Png | ImageFormat::Webp => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        };
        let params = ScreenshotParams::builder().format(cdp_format).build();
        let bytes = self
            .page
            .screenshot(params)
            .await
            .map_err(|e| ScreenshotError::CaptureFailed(e.to_string()))?;

        if format == ImageFormat::Webp {
            let img = image::load_from_memory(&bytes)
                .map_err(|e| ScreenshotError::CaptureFailed(e.to_string()))?;
            let mut webp = Vec::new();
            img.write_to(&mut std::io::Cursor::new(&mut webp), image::ImageFormat::WebP)
                .map_err(|e| ScreenshotError::CaptureFailed(e.to_string()))?;
            return Ok(webp);
        }

        Ok(bytes)
    }

    async fn install_route_handler(
        &self,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<(), ScreenshotError> {
        self.clear_route_handlers().await?;

        let patterns = vec![
            RequestPattern {
                url_pattern: Some("*".to_string()),
                resource_type: None,
                request_stage: Some(RequestStage::Request),
            },
            RequestPattern {
                url_pattern: Some("*".to_string()),
                resource_type: None,
                request_stage: Some(RequestStage::Response),
            },
        ];
        self.page
            .execute(fetch::EnableParams {
                patterns: Some(patterns),
                handle_auth_requests: None,
            })
            .await
            .map_err(Self::err_browser)?;

        let mut events = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(Self::err_browser)?;

        let page = self.page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let route = RouteRequest {
                    url: event.request.url.clone(),
                    method: event.request.method.clone(),
                    resource_type: classify_resource(&event.resource_type),
                };
                let request_id = event.request_id.clone();

                // Response-stage pauses carry a status code
                if let Some(status) = event.response_status_code {
                    if status == 200 && handler.wants_response(&route) {
                        match page.execute(GetResponseBodyParams::new(request_id.clone())).await {
                            Ok(body) => {
                                let bytes = if body.result.base64_encoded {
                                    base64::engine::general_purpose::STANDARD
                                        .decode(body.result.body.as_bytes())
                                        .unwrap_or_default()
                                } else {
                                    body.result.body.clone().into_bytes()
                                };
                                let headers: HashMap<String, String> = event
                                    .response_headers
                                    .as_deref()
                                    .unwrap_or(&[])
                                    .iter()
                                    .map(|h| (h.name.to_lowercase(), h.value.clone()))
                                    .collect();
                                handler.on_response(&route.url, &headers, &bytes).await;
                            }
                            Err(e) => {
                                debug!(url = %route.url, error = %e, "response body unavailable");
                            }
                        }
                    }
                    if let Err(e) = page.execute(ContinueRequestParams::new(request_id)).await {
                        debug!(error = %e, "continue after response stage failed");
                    }
                    continue;
                }

                match handler.on_request(&route).await {
                    RouteDecision::Continue => {
                        if let Err(e) = page.execute(ContinueRequestParams::new(request_id)).await {
                            debug!(error = %e, "continue request failed");
                        }
                    }
                    RouteDecision::Abort => {
                        let fail =
                            FailRequestParams::new(request_id, ErrorReason::BlockedByClient);
                        if let Err(e) = page.execute(fail).await {
                            debug!(error = %e, "abort request failed");
                        }
                    }
                    RouteDecision::Fulfill {
                        status,
                        headers,
                        body,
                    } => {
                        let header_entries: Vec<HeaderEntry> = headers
                            .into_iter()
                            .map(|(name, value)| HeaderEntry { name, value })
                            .collect();
                        let encoded = base64::engine::general_purpose::STANDARD.encode(&body);
                        let fulfill = FulfillRequestParams::builder()
                            .request_id(request_id)
                            .response_code(status as i64)
                            .response_headers(header_entries)
                            .body(encoded)
                            .build();
                        match fulfill {
                            Ok(params) => {
                                if let Err(e) = page.execute(params).await {
                                    debug!(error = %e, "fulfill request failed");
                                }
                            }
                            Err(e) => debug!(error = %e, "fulfill params invalid"),
                        }
                    }
                }
            }
        });

        *self.interceptor.lock().await = Some(task);
        Ok(())
    }

    async fn clear_route_handlers(&self) -> Result<(), ScreenshotError> {
        if let Some(task) = self.interceptor.lock().await.take() {
            task.abort();
            if let Err(e) = self.page.execute(fetch::DisableParams::default()).await {
                debug!(error = %e, "disabling fetch interception failed");
            }
        }
        Ok(())
    }

    async fn reset(&self, deadline: Duration) -> Result<(), ScreenshotError> {
        self.clear_route_handlers().await?;
        match timeout(deadline, self.page.goto("about:blank")).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ScreenshotError::Browser(format!("reset failed: {e}"))),
            Err(_) => Err(ScreenshotError::Timeout(deadline)),
        }
    }

    async fn close(&self) -> Result<(), ScreenshotError> {
        self.clear_route_handlers().await?;
        self.closed.store(true, Ordering::Relaxed);
        self.page
            .clone()
            .close()
            .await
            .map(|_| ())
            .map_err(|e| ScreenshotError::Browser(format!("close page: {e}")))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
