//! Browser pool management for concurrent browser processes
//!
//! A fixed-index pool of long-lived browser processes with FIFO reuse,
//! health/age-based recycling, proactive scaling under load and bounded,
//! jittered waiting when every slot is busy. All slot and available-list
//! mutations happen under one mutex; process launches and closes are the
//! only slow operations performed while holding it, matching the
//! acquisition algorithm's single-writer design.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserContext, BrowserFactory, BrowserHandle, ContextOptions};
use crate::config::SharedSettings;
use crate::error::ScreenshotError;

/// Usage count beyond which a slot is recycled under high load.
const HIGH_LOAD_USAGE_LIMIT: u64 = 50;

/// Utilization fraction treated as high load during cleanup.
const HIGH_LOAD_UTILIZATION: f64 = 0.8;

/// Browsers added per cleanup pass when scaling up under load.
const SCALE_UP_BATCH: usize = 5;

/// Longest single wait between acquisition attempts, in seconds.
const MAX_WAIT_SECS: f64 = 8.0;

/// Per-resource timeout while shutting the pool down.
const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// One owned browser process.
pub struct BrowserSlot {
    pub index: usize,
    pub handle: Arc<dyn BrowserHandle>,
    pub created_at: Instant,
    pub last_used: Instant,
    pub usage_count: u64,
    /// Contexts created through this slot and not yet released
    pub contexts: Vec<Arc<dyn BrowserContext>>,
}

impl BrowserSlot {
    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }
}

struct PoolInner {
    /// Slot positions are stable; a recycled position is None until refilled
    slots: Vec<Option<BrowserSlot>>,
    /// FIFO queue of available slot indices
    available: VecDeque<usize>,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn in_use(&self) -> usize {
        self.total() - self.available.len()
    }

    fn utilization(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.in_use() as f64 / total as f64
        }
    }

    /// First free position, or a new one at the end.
    fn free_position(&mut self) -> usize {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    errors: AtomicU64,
    peak_usage: AtomicUsize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BrowserPoolStats {
    pub total_slots: usize,
    pub available: usize,
    pub in_use: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub created: u64,
    pub reused: u64,
    pub recycled: u64,
    pub errors: u64,
    pub peak_usage: usize,
}

/// Per-slot health snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotHealth {
    pub index: usize,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub usage_count: u64,
    pub live_contexts: usize,
    pub connected: bool,
}

pub struct BrowserPool {
    settings: SharedSettings,
    factory: Arc<dyn BrowserFactory>,
    inner: Mutex<PoolInner>,
    counters: PoolCounters,
    shutting_down: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserPool {
    /// Create the pool and launch `min_size` browsers up front.
    pub async fn new(
        settings: SharedSettings,
        factory: Arc<dyn BrowserFactory>,
    ) -> Result<Arc<Self>, ScreenshotError> {
        let pool = Arc::new(Self {
            settings,
            factory,
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                available: VecDeque::new(),
            }),
            counters: PoolCounters::default(),
            shutting_down: AtomicBool::new(false),
            cleanup_task: Mutex::new(None),
        });

        let min_size = pool.settings.snapshot().pool.min_size;
        {
            let mut inner = pool.inner.lock().await;
            for _ in 0..min_size {
                let slot = pool.launch_slot(&mut inner).await?;
                inner.available.push_back(slot);
            }
        }
        info!(min_size, "browser pool initialized");

        let cleanup = pool.clone().spawn_cleanup();
        *pool.cleanup_task.lock().await = Some(cleanup);

        Ok(pool)
    }

    /// Launch a new browser into the first free position. Caller holds the
    /// pool lock.
    async fn launch_slot(&self, inner: &mut PoolInner) -> Result<usize, ScreenshotError> {
        let settings = self.settings.snapshot();
        let index = inner.free_position();

        let handle = match self
            .factory
            .launch(settings.engine, index, &settings)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let now = Instant::now();
        inner.slots[index] = Some(BrowserSlot {
            index,
            handle,
            created_at: now,
            last_used: now,
            usage_count: 0,
            contexts: Vec::new(),
        });
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(index, pool_size = inner.total(), "browser slot created");
        Ok(index)
    }

    fn note_usage(&self, inner: &PoolInner) {
        self.counters
            .peak_usage
            .fetch_max(inner.in_use(), Ordering::Relaxed);
    }

    /// Acquire a browser for exclusive use.
    ///
    /// Fast path pops the FIFO available list; below the (dynamically
    /// re-read) maximum a new browser is launched; otherwise the caller
    /// backs off with utilization-scaled jittered waits before giving up
    /// with `PoolExhausted`.
    pub async fn acquire(&self) -> Result<(Arc<dyn BrowserHandle>, usize), ScreenshotError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(ScreenshotError::Browser("pool is shutting down".into()));
        }

        let (utilization, pool_size) = {
            let mut inner = self.inner.lock().await;

            if let Some(handle) = self.try_take_available(&mut inner) {
                return Ok(handle);
            }

            let dynamic_max = self.settings.pool_max_size();
            if inner.total() < dynamic_max {
                match self.launch_slot(&mut inner).await {
                    Ok(index) => {
                        let slot = inner.slots[index].as_mut().expect("slot just created");
                        slot.last_used = Instant::now();
                        slot.usage_count += 1;
                        let handle = slot.handle.clone();
                        self.note_usage(&inner);
                        return Ok((handle, index));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to grow pool, falling back to waiting");
                    }
                }
            }

            (inner.utilization(), inner.total())
        };

        warn!(
            pool_size,
            utilization = %format!("{:.0}%", utilization * 100.0),
            "browser pool at capacity, waiting for an available browser"
        );

        // Adaptive backoff: a busier pool waits longer and retries more
        let max_attempts = (5 + (5.0 * utilization) as usize).min(10);
        let base_wait = 0.2 * (1.0 + utilization);

        for retry in 0..max_attempts {
            let wait = (base_wait * 2f64.powi(retry as i32)).min(MAX_WAIT_SECS);
            let jitter = wait * 0.2;
            let wait = wait + (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * jitter;
            debug!(
                retry = retry + 1,
                max_attempts,
                wait = %format!("{wait:.2}s"),
                "waiting for an available browser"
            );
            sleep(Duration::from_secs_f64(wait.max(0.0))).await;

            let mut inner = self.inner.lock().await;
            if let Some(handle) = self.try_take_available(&mut inner) {
                info!(attempts = retry + 1, "acquired browser after waiting");
                return Ok(handle);
            }

            // The ceiling may have been raised while we slept
            let dynamic_max = self.settings.pool_max_size();
            if inner.total() < dynamic_max {
                if let Ok(index) = self.launch_slot(&mut inner).await {
                    let slot = inner.slots[index].as_mut().expect("slot just created");
                    slot.last_used = Instant::now();
                    slot.usage_count += 1;
                    let handle = slot.handle.clone();
                    self.note_usage(&inner);
                    info!(index, "created browser after max size increase");
                    return Ok((handle, index));
                }
            }
        }

        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.lock().await;
        error!(
            pool_size = inner.total(),
            in_use = inner.in_use(),
            "browser pool exhausted after maximum wait attempts"
        );
        Err(ScreenshotError::PoolExhausted {
            pool_size: inner.total(),
            in_use: inner.in_use(),
            wait_attempts: max_attempts,
        })
    }

    fn try_take_available(
        &self,
        inner: &mut PoolInner,
    ) -> Option<(Arc<dyn BrowserHandle>, usize)> {
        while let Some(index) = inner.available.pop_front() {
            let Some(slot) = inner.slots[index].as_mut() else {
                // Position recycled while queued; skip the stale index
                continue;
            };
            slot.last_used = Instant::now();
            slot.usage_count += 1;
            let handle = slot.handle.clone();
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            self.note_usage(inner);
            return Some((handle, index));
        }
        None
    }

    /// Return a browser to the pool.
    ///
    /// Unhealthy or over-age slots are destroyed and, when that would drop
    /// the pool below `min_size`, replaced in position.
    pub async fn release(&self, slot_index: usize, healthy: bool) {
        let pool_settings = self.settings.snapshot().pool;

        let to_destroy = {
            let mut inner = self.inner.lock().await;
            let Some(slot) = inner.slots.get_mut(slot_index).and_then(|s| s.as_mut()) else {
                warn!(slot_index, "release for unknown slot");
                return;
            };

            if healthy && slot.age() <= pool_settings.max_age && slot.handle.is_connected() {
                slot.last_used = Instant::now();
                if !inner.available.contains(&slot_index) {
                    inner.available.push_back(slot_index);
                }
                return;
            }

            debug!(slot_index, healthy, "recycling browser on release");
            self.take_slot(&mut inner, slot_index)
        };

        if let Some(slot) = to_destroy {
            self.destroy_slot(slot).await;
            self.refill_to_min().await;
        }
    }

    /// Detach a slot from the pool. Caller holds the lock.
    fn take_slot(&self, inner: &mut PoolInner, index: usize) -> Option<BrowserSlot> {
        inner.available.retain(|&i| i != index);
        let slot = inner.slots.get_mut(index).and_then(|s| s.take());
        if slot.is_some() {
            self.counters.recycled.fetch_add(1, Ordering::Relaxed);
        }
        slot
    }

    async fn destroy_slot(&self, slot: BrowserSlot) {
        for context in &slot.contexts {
            if let Err(e) = timeout(SHUTDOWN_CLOSE_TIMEOUT, context.close()).await {
                warn!(index = slot.index, error = %e, "context close timed out during recycle");
            }
        }
        match timeout(SHUTDOWN_CLOSE_TIMEOUT, slot.handle.close()).await {
            Ok(Err(e)) => warn!(index = slot.index, error = %e, "browser close failed during recycle"),
            Err(_) => warn!(index = slot.index, "browser close timed out during recycle"),
            Ok(Ok(())) => {}
        }
    }

    /// Launch replacements until the pool is back at `min_size`.
    async fn refill_to_min(&self) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let min_size = self.settings.snapshot().pool.min_size;
        let mut inner = self.inner.lock().await;
        while inner.total() < min_size {
            match self.launch_slot(&mut inner).await {
                Ok(index) => inner.available.push_back(index),
                Err(e) => {
                    warn!(error = %e, "failed to refill pool to min size");
                    break;
                }
            }
        }
    }

    /// Create a context on a held slot.
    pub async fn new_context(
        &self,
        slot_index: usize,
        options: &ContextOptions,
    ) -> Result<Arc<dyn BrowserContext>, ScreenshotError> {
        let (handle, context_timeout) = {
            let inner = self.inner.lock().await;
            let slot = inner
                .slots
                .get(slot_index)
                .and_then(|s| s.as_ref())
                .ok_or_else(|| ScreenshotError::Browser(format!("no slot {slot_index}")))?;
            (
                slot.handle.clone(),
                self.settings.snapshot().timeouts.context_creation,
            )
        };

        let context = timeout(context_timeout, handle.new_context(options))
            .await
            .map_err(|_| ScreenshotError::Timeout(context_timeout))??;

        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.slots.get_mut(slot_index).and_then(|s| s.as_mut()) {
            slot.contexts.push(context.clone());
        }
        Ok(context)
    }

    /// Close a context and forget it on its slot.
    pub async fn release_context(&self, slot_index: usize, context: &Arc<dyn BrowserContext>) {
        if let Err(e) = context.close().await {
            debug!(slot_index, error = %e, "context close failed on release");
        }
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.slots.get_mut(slot_index).and_then(|s| s.as_mut()) {
            slot.contexts.retain(|c| !Arc::ptr_eq(c, context));
        }
    }

    /// Scoped acquisition of a context plus its slot.
    ///
    /// Both are released on every exit path; a failure during setup marks
    /// the slot unhealthy.
    pub async fn managed_context(
        self: &Arc<Self>,
        options: ContextOptions,
    ) -> Result<ManagedContext, ScreenshotError> {
        let (_, slot_index) = self.acquire().await?;
        match self.new_context(slot_index, &options).await {
            Ok(context) => Ok(ManagedContext {
                pool: self.clone(),
                slot_index,
                context,
                released: AtomicBool::new(false),
            }),
            Err(e) => {
                warn!(slot_index, error = %e, "context setup failed, recycling slot");
                self.release(slot_index, false).await;
                Err(e)
            }
        }
    }

    /// Proactive maintenance pass, run every `cleanup_interval`.
    pub async fn cleanup(&self) {
        let pool_settings = self.settings.snapshot().pool;

        let (to_destroy, want_growth) = {
            let mut inner = self.inner.lock().await;
            let utilization = inner.utilization();
            let high_load = utilization > HIGH_LOAD_UTILIZATION;
            let total = inner.total();

            let mut victims = Vec::new();
            let available: Vec<usize> = inner.available.iter().copied().collect();
            for index in available {
                let Some(slot) = inner.slots.get(index).and_then(|s| s.as_ref()) else {
                    continue;
                };
                let over_age = slot.age() > pool_settings.max_age;
                let idle_out = slot.idle_time() > pool_settings.idle_timeout;
                let worn_out = high_load && slot.usage_count > HIGH_LOAD_USAGE_LIMIT;
                let dead = !slot.handle.is_connected();

                if over_age || idle_out || worn_out || dead {
                    debug!(
                        index,
                        over_age, idle_out, worn_out, dead, "cleanup recycling slot"
                    );
                    victims.push(index);
                }
            }
            let to_destroy: Vec<BrowserSlot> = victims
                .into_iter()
                .filter_map(|i| self.take_slot(&mut inner, i))
                .collect();

            let want_growth = if high_load && total < pool_settings.max_size {
                (pool_settings.max_size - total).min(SCALE_UP_BATCH)
            } else {
                0
            };
            (to_destroy, want_growth)
        };

        for slot in to_destroy {
            self.destroy_slot(slot).await;
        }

        if want_growth > 0 {
            let mut inner = self.inner.lock().await;
            for _ in 0..want_growth {
                match self.launch_slot(&mut inner).await {
                    Ok(index) => {
                        inner.available.push_back(index);
                        info!(index, "scaled pool up under high load");
                    }
                    Err(e) => {
                        warn!(error = %e, "scale-up launch failed");
                        break;
                    }
                }
            }
        }

        self.refill_to_min().await;
    }

    fn spawn_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.settings.snapshot().pool.cleanup_interval;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if self.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                self.cleanup().await;
            }
        })
    }

    /// Destroy up to `count` slots, preferring in-use ones.
    ///
    /// Invoked by the watchdog when the pool looks stuck: slots held
    /// forever with no traffic are presumed wedged, and destroying them
    /// releases whatever is waiting on them. Returns how many were
    /// recycled.
    pub async fn force_recycle(&self, count: usize) -> usize {
        let to_destroy = {
            let mut inner = self.inner.lock().await;
            let in_use: Vec<usize> = (0..inner.slots.len())
                .filter(|i| inner.slots[*i].is_some() && !inner.available.contains(i))
                .collect();
            let available: Vec<usize> = inner.available.iter().copied().collect();

            let victims: Vec<usize> = in_use
                .into_iter()
                .chain(available)
                .take(count)
                .collect();

            victims
                .into_iter()
                .filter_map(|i| self.take_slot(&mut inner, i))
                .collect::<Vec<_>>()
        };

        let recycled = to_destroy.len();
        if recycled > 0 {
            warn!(recycled, "force recycling browser slots");
        }
        for slot in to_destroy {
            self.destroy_slot(slot).await;
        }
        self.refill_to_min().await;
        recycled
    }

    /// Recycle every slot older than `max_age`, regardless of state.
    pub async fn recycle_older_than(&self, max_age: Duration) -> usize {
        let to_destroy = {
            let mut inner = self.inner.lock().await;
            let aged: Vec<usize> = (0..inner.slots.len())
                .filter(|&i| {
                    inner.slots[i]
                        .as_ref()
                        .map(|s| s.age() > max_age)
                        .unwrap_or(false)
                })
                .collect();
            aged.into_iter()
                .filter_map(|i| self.take_slot(&mut inner, i))
                .collect::<Vec<_>>()
        };

        let recycled = to_destroy.len();
        for slot in to_destroy {
            info!(index = slot.index, age = ?slot.age(), "recycling over-age slot");
            self.destroy_slot(slot).await;
        }
        self.refill_to_min().await;
        recycled
    }

    pub async fn stats(&self) -> BrowserPoolStats {
        let inner = self.inner.lock().await;
        let pool_settings = self.settings.snapshot().pool;
        BrowserPoolStats {
            total_slots: inner.total(),
            available: inner.available.len(),
            in_use: inner.in_use(),
            min_size: pool_settings.min_size,
            max_size: pool_settings.max_size,
            utilization: inner.utilization(),
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            peak_usage: self.counters.peak_usage.load(Ordering::Relaxed),
        }
    }

    pub async fn health(&self) -> Vec<SlotHealth> {
        let inner = self.inner.lock().await;
        inner
            .slots
            .iter()
            .flatten()
            .map(|slot| SlotHealth {
                index: slot.index,
                age_secs: slot.age().as_secs(),
                idle_secs: slot.idle_time().as_secs(),
                usage_count: slot.usage_count,
                live_contexts: slot.contexts.len(),
                connected: slot.handle.is_connected(),
            })
            .collect()
    }

    /// Close everything. Errors are logged and swallowed; shutdown never
    /// fails.
    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        self.shutting_down.store(true, Ordering::Relaxed);

        if let Some(task) = self.cleanup_task.lock().await.take() {
            task.abort();
        }

        let slots: Vec<BrowserSlot> = {
            let mut inner = self.inner.lock().await;
            inner.available.clear();
            inner.slots.iter_mut().filter_map(|s| s.take()).collect()
        };

        for slot in slots {
            self.destroy_slot(slot).await;
        }
        info!("browser pool shutdown complete");
    }
}

/// Scoped (context, slot) acquisition from [`BrowserPool::managed_context`].
pub struct ManagedContext {
    pool: Arc<BrowserPool>,
    slot_index: usize,
    context: Arc<dyn BrowserContext>,
    released: AtomicBool,
}

impl ManagedContext {
    pub fn context(&self) -> &Arc<dyn BrowserContext> {
        &self.context
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// Release the context and the slot, reporting slot health.
    pub async fn release(self, healthy: bool) {
        self.released.store(true, Ordering::Relaxed);
        self.pool
            .release_context(self.slot_index, &self.context)
            .await;
        self.pool.release(self.slot_index, healthy).await;
    }
}

impl Drop for ManagedContext {
    fn drop(&mut self) {
        if self.released.load(Ordering::Relaxed) {
            return;
        }
        // Backstop for callers that drop without releasing
        let pool = self.pool.clone();
        let slot_index = self.slot_index;
        let context = self.context.clone();
        tokio::spawn(async move {
            pool.release_context(slot_index, &context).await;
            pool.release(slot_index, true).await;
        });
    }
}
