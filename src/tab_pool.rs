//! Tab pool layered on top of the browser pool
//!
//! Pages are expensive to open and cheap to reset, so released tabs are
//! kept blank and handed to the next request instead of being closed.
//! Each browser slot hosts at most `max_tabs_per_browser` tabs; a request
//! that cannot reuse or create one polls for a release until a deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::browser::{BrowserContext, PageHandle};
use crate::config::SharedSettings;
use crate::error::ScreenshotError;

/// Reuse cap per tab; beyond this the tab is closed instead of pooled.
const TAB_USAGE_LIMIT: u64 = 50;

/// Poll period while waiting for a tab to free up.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Deadline for the wait loop.
const WAIT_DEADLINE: Duration = Duration::from_secs(30);

/// Timeout for the blank-navigation reset on release.
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

struct TabEntry {
    id: u64,
    slot_index: usize,
    page: Arc<dyn PageHandle>,
    created_at: Instant,
    last_used: Instant,
    busy: bool,
    usage_count: u64,
}

impl TabEntry {
    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// Identifies a leased tab; returned to [`TabPool::release_tab`].
pub struct TabLease {
    pub id: u64,
    pub slot_index: usize,
    pub page: Arc<dyn PageHandle>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TabPoolStats {
    pub total: usize,
    pub busy: usize,
    pub available: usize,
    pub created: u64,
    pub reused: u64,
    pub cleaned: u64,
}

struct TabInner {
    tabs: Vec<TabEntry>,
}

impl TabInner {
    fn count_for_slot(&self, slot_index: usize) -> usize {
        self.tabs.iter().filter(|t| t.slot_index == slot_index).count()
    }

    /// Prefer an idle tab on the same slot, then any idle tab.
    fn find_available(&mut self, slot_index: usize) -> Option<&mut TabEntry> {
        let preferred = self
            .tabs
            .iter()
            .position(|t| !t.busy && t.slot_index == slot_index);
        let index = preferred.or_else(|| self.tabs.iter().position(|t| !t.busy))?;
        self.tabs.get_mut(index)
    }
}

pub struct TabPool {
    settings: SharedSettings,
    inner: Mutex<TabInner>,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    cleaned: AtomicU64,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl TabPool {
    pub fn new(settings: SharedSettings) -> Arc<Self> {
        let pool = Arc::new(Self {
            settings,
            inner: Mutex::new(TabInner { tabs: Vec::new() }),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            cleaned: AtomicU64::new(0),
            cleanup_task: Mutex::new(None),
        });

        let cleanup = pool.clone().spawn_cleanup();
        *pool.cleanup_task.try_lock().expect("fresh pool") = Some(cleanup);
        pool
    }

    /// Lease a tab hosted by `slot_index`, creating one on `context` when
    /// the reuse scan comes up empty and the per-browser cap allows it.
    pub async fn get_tab(
        &self,
        slot_index: usize,
        context: &Arc<dyn BrowserContext>,
        width: u32,
        height: u32,
    ) -> Result<TabLease, ScreenshotError> {
        let tab_settings = self.settings.snapshot().tabs;

        if tab_settings.reuse {
            if let Some(lease) = self.try_reuse(slot_index).await {
                lease.page.set_viewport(width, height).await?;
                debug!(slot_index, tab = lease.id, "reusing pooled tab");
                return Ok(lease);
            }
        }

        {
            let inner = self.inner.lock().await;
            if inner.count_for_slot(slot_index) < tab_settings.max_tabs_per_browser {
                drop(inner);
                let page = self.create_page(context).await?;
                page.set_viewport(width, height).await?;

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let now = Instant::now();
                let mut inner = self.inner.lock().await;
                inner.tabs.push(TabEntry {
                    id,
                    slot_index,
                    page: page.clone(),
                    created_at: now,
                    last_used: now,
                    busy: true,
                    usage_count: 1,
                });
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(slot_index, tab = id, "created new tab");
                return Ok(TabLease {
                    id,
                    slot_index,
                    page,
                });
            }
        }

        warn!(slot_index, "tab limit reached, waiting for an available tab");
        self.wait_for_tab(slot_index, width, height).await
    }

    async fn try_reuse(&self, slot_index: usize) -> Option<TabLease> {
        let mut inner = self.inner.lock().await;
        let entry = inner.find_available(slot_index)?;
        entry.busy = true;
        entry.last_used = Instant::now();
        entry.usage_count += 1;
        let lease = TabLease {
            id: entry.id,
            slot_index: entry.slot_index,
            page: entry.page.clone(),
        };
        self.reused.fetch_add(1, Ordering::Relaxed);
        Some(lease)
    }

    async fn create_page(
        &self,
        context: &Arc<dyn BrowserContext>,
    ) -> Result<Arc<dyn PageHandle>, ScreenshotError> {
        let page_timeout = self.settings.snapshot().timeouts.page_creation;
        timeout(page_timeout, context.new_page())
            .await
            .map_err(|_| ScreenshotError::Timeout(page_timeout))?
    }

    /// Poll for a released tab until the deadline.
    async fn wait_for_tab(
        &self,
        slot_index: usize,
        width: u32,
        height: u32,
    ) -> Result<TabLease, ScreenshotError> {
        let deadline = Instant::now() + WAIT_DEADLINE;
        while Instant::now() < deadline {
            sleep(WAIT_POLL).await;
            if let Some(lease) = self.try_reuse(slot_index).await {
                lease.page.set_viewport(width, height).await?;
                return Ok(lease);
            }
        }
        Err(ScreenshotError::TabUnavailable(format!(
            "no tab freed within {WAIT_DEADLINE:?}"
        )))
    }

    /// Return a leased tab.
    ///
    /// Unhealthy, over-age or worn-out tabs are closed; otherwise the tab
    /// is reset to a blank document and pooled. A failed reset closes the
    /// tab instead of pooling a page in an unknown state.
    pub async fn release_tab(&self, lease: TabLease, healthy: bool) {
        let tab_settings = self.settings.snapshot().tabs;

        let retire = {
            let inner = self.inner.lock().await;
            match inner.tabs.iter().find(|t| t.id == lease.id) {
                Some(entry) => {
                    !healthy
                        || !tab_settings.reuse
                        || entry.age() > tab_settings.max_age
                        || entry.usage_count > TAB_USAGE_LIMIT
                }
                None => {
                    // Already cleaned up; just close the page
                    true
                }
            }
        };

        if retire {
            self.close_tab(lease.id, &lease.page).await;
            return;
        }

        match lease.page.reset(RESET_TIMEOUT).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.tabs.iter_mut().find(|t| t.id == lease.id) {
                    entry.busy = false;
                    entry.last_used = Instant::now();
                    debug!(tab = lease.id, usage = entry.usage_count, "tab released for reuse");
                }
            }
            Err(e) => {
                warn!(tab = lease.id, error = %e, "tab reset failed, closing");
                self.close_tab(lease.id, &lease.page).await;
            }
        }
    }

    async fn close_tab(&self, id: u64, page: &Arc<dyn PageHandle>) {
        {
            let mut inner = self.inner.lock().await;
            inner.tabs.retain(|t| t.id != id);
        }
        self.cleaned.fetch_add(1, Ordering::Relaxed);
        if !page.is_closed() {
            if let Err(e) = page.close().await {
                debug!(tab = id, error = %e, "closing tab failed");
            }
        }
    }

    /// Forget every tab hosted by a recycled browser slot without touching
    /// the pages; the slot teardown closes them.
    pub async fn forget_slot(&self, slot_index: usize) {
        let mut inner = self.inner.lock().await;
        let before = inner.tabs.len();
        inner.tabs.retain(|t| t.slot_index != slot_index);
        let dropped = before - inner.tabs.len();
        if dropped > 0 {
            debug!(slot_index, dropped, "dropped tabs of recycled slot");
        }
    }

    /// Close idle and over-age tabs.
    pub async fn cleanup(&self) {
        let tab_settings = self.settings.snapshot().tabs;

        let victims: Vec<(u64, Arc<dyn PageHandle>)> = {
            let inner = self.inner.lock().await;
            inner
                .tabs
                .iter()
                .filter(|t| {
                    !t.busy
                        && (t.idle_time() > tab_settings.idle_timeout
                            || t.age() > tab_settings.max_age)
                })
                .map(|t| (t.id, t.page.clone()))
                .collect()
        };

        for (id, page) in victims {
            debug!(tab = id, "cleanup closing idle tab");
            self.close_tab(id, &page).await;
        }
    }

    fn spawn_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.settings.snapshot().tabs.cleanup_interval;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.cleanup().await;
            }
        })
    }

    pub async fn stats(&self) -> TabPoolStats {
        let inner = self.inner.lock().await;
        let busy = inner.tabs.iter().filter(|t| t.busy).count();
        TabPoolStats {
            total: inner.tabs.len(),
            busy,
            available: inner.tabs.len() - busy,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            cleaned: self.cleaned.load(Ordering::Relaxed),
        }
    }

    /// Close every tab. Called during service shutdown, after admission
    /// has stopped.
    pub async fn shutdown(&self) {
        info!("shutting down tab pool");
        if let Some(task) = self.cleanup_task.lock().await.take() {
            task.abort();
        }

        let tabs: Vec<(u64, Arc<dyn PageHandle>)> = {
            let mut inner = self.inner.lock().await;
            inner.tabs.drain(..).map(|t| (t.id, t.page)).collect()
        };
        for (id, page) in tabs {
            if let Err(e) = page.close().await {
                debug!(tab = id, error = %e, "closing tab during shutdown failed");
            }
        }
        info!("tab pool shutdown complete");
    }
}
