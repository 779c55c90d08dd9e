//! Pool watchdog: detects stuck browsers and forces recovery
//!
//! A pool can wedge when pages hang without failing: every slot stays
//! in-use while no requests complete. The watchdog compares utilization
//! against recent request activity and force-recycles half the in-use
//! slots when the combination says "stuck". It also retires any slot
//! past a hard age limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser_pool::BrowserPool;
use crate::config::SharedSettings;

/// Shared request-activity signal between the pipeline and the watchdog.
pub struct RequestActivity {
    last_request: StdMutex<Instant>,
    count: AtomicU64,
}

impl RequestActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_request: StdMutex::new(Instant::now()),
            count: AtomicU64::new(0),
        })
    }

    pub fn record_request(&self) {
        *self.last_request.lock().expect("activity lock poisoned") = Instant::now();
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_time(&self) -> std::time::Duration {
        self.last_request
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    pub fn total_requests(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WatchdogStats {
    pub checks: u64,
    pub stuck_detections: u64,
    pub forced_recycles: u64,
    pub age_recycles: u64,
}

pub struct PoolWatchdog {
    settings: SharedSettings,
    pool: Arc<BrowserPool>,
    activity: Arc<RequestActivity>,
    checks: AtomicU64,
    stuck_detections: AtomicU64,
    forced_recycles: AtomicU64,
    age_recycles: AtomicU64,
}

impl PoolWatchdog {
    pub fn new(
        settings: SharedSettings,
        pool: Arc<BrowserPool>,
        activity: Arc<RequestActivity>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            pool,
            activity,
            checks: AtomicU64::new(0),
            stuck_detections: AtomicU64::new(0),
            forced_recycles: AtomicU64::new(0),
            age_recycles: AtomicU64::new(0),
        })
    }

    /// Spawn the periodic scan loop; the caller owns the handle.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let interval = watchdog.settings.snapshot().watchdog.interval;
            info!(interval = ?interval, "pool watchdog started");
            loop {
                sleep(interval).await;
                watchdog.check().await;
            }
        })
    }

    /// One scan: stuck detection plus hard age enforcement.
    pub async fn check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let watchdog_settings = self.settings.snapshot().watchdog;
        let stats = self.pool.stats().await;
        let idle = self.activity.idle_time();

        debug!(
            utilization = %format!("{:.0}%", stats.utilization * 100.0),
            idle = ?idle,
            in_use = stats.in_use,
            "watchdog scan"
        );

        // High utilization with no traffic means slots are held by hung
        // work; destroy half of them to free the waiters
        if stats.utilization > watchdog_settings.usage_threshold
            && idle > watchdog_settings.idle_threshold
            && stats.in_use > 0
        {
            self.stuck_detections.fetch_add(1, Ordering::Relaxed);
            let target = (stats.in_use / 2).max(1);
            warn!(
                in_use = stats.in_use,
                idle = ?idle,
                target,
                "pool looks stuck, force recycling"
            );
            let recycled = self.pool.force_recycle(target).await;
            self.forced_recycles
                .fetch_add(recycled as u64, Ordering::Relaxed);
        }

        let aged = self
            .pool
            .recycle_older_than(watchdog_settings.force_recycle_age)
            .await;
        if aged > 0 {
            self.age_recycles.fetch_add(aged as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> WatchdogStats {
        WatchdogStats {
            checks: self.checks.load(Ordering::Relaxed),
            stuck_detections: self.stuck_detections.load(Ordering::Relaxed),
            forced_recycles: self.forced_recycles.load(Ordering::Relaxed),
            age_recycles: self.age_recycles.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::ScriptedFactory;
    use crate::config::Settings;
    use std::time::Duration;

    fn shared(min: usize, max: usize, usage_threshold: f64, idle: Duration) -> SharedSettings {
        let mut s = Settings::default();
        s.pool.min_size = min;
        s.pool.max_size = max;
        s.pool.cleanup_interval = Duration::from_secs(3600);
        s.watchdog.usage_threshold = usage_threshold;
        s.watchdog.idle_threshold = idle;
        s.watchdog.force_recycle_age = Duration::from_secs(3600);
        SharedSettings::new(s)
    }

    #[tokio::test]
    async fn recycles_when_stuck() {
        let settings = shared(2, 2, 0.5, Duration::from_millis(10));
        let pool = BrowserPool::new(settings.clone(), ScriptedFactory::fresh())
            .await
            .unwrap();
        let activity = RequestActivity::new();
        let watchdog = PoolWatchdog::new(settings, pool.clone(), activity.clone());

        // Hold both slots and let the activity signal go stale
        let (_, _a) = pool.acquire().await.unwrap();
        let (_, _b) = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        watchdog.check().await;

        let stats = watchdog.stats();
        assert_eq!(stats.stuck_detections, 1);
        assert!(stats.forced_recycles >= 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn does_not_recycle_with_recent_traffic() {
        let settings = shared(2, 2, 0.5, Duration::from_secs(60));
        let pool = BrowserPool::new(settings.clone(), ScriptedFactory::fresh())
            .await
            .unwrap();
        let activity = RequestActivity::new();
        let watchdog = PoolWatchdog::new(settings, pool.clone(), activity.clone());

        let (_, _a) = pool.acquire().await.unwrap();
        let (_, _b) = pool.acquire().await.unwrap();
        activity.record_request();

        watchdog.check().await;

        let stats = watchdog.stats();
        assert_eq!(stats.stuck_detections, 0);
        assert_eq!(stats.forced_recycles, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn recycles_over_age_slots() {
        let settings = shared(1, 2, 0.99, Duration::from_secs(3600));
        // Recycle anything older than zero seconds
        settings.update(|s| s.watchdog.force_recycle_age = Duration::from_millis(1));
        let pool = BrowserPool::new(settings.clone(), ScriptedFactory::fresh())
            .await
            .unwrap();
        let activity = RequestActivity::new();
        let watchdog = PoolWatchdog::new(settings, pool.clone(), activity);

        tokio::time::sleep(Duration::from_millis(10)).await;
        watchdog.check().await;

        assert!(watchdog.stats().age_recycles >= 1);
        // Pool refilled to min after the forced recycle
        assert_eq!(pool.stats().await.total_slots, 1);
        pool.shutdown().await;
    }
}
