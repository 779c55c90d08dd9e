//! Request throttling in front of the capture pipeline
//!
//! Two bounded resources: a semaphore capping concurrently-running
//! requests and a bounded waiting room in front of it. A request that
//! finds both full is rejected instead of queued without bound.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ThrottleSettings;
use crate::error::ScreenshotError;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ThrottleStats {
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub active: usize,
    pub queued: usize,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub rejected_requests: u64,
    pub peak_active: usize,
    pub peak_queued: usize,
}

pub struct RequestThrottle {
    name: String,
    max_concurrent: usize,
    queue_size: usize,
    permits: Arc<Semaphore>,
    queue_slots: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    total: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    peak_active: AtomicUsize,
    peak_queued: AtomicUsize,
}

impl RequestThrottle {
    pub fn new(name: impl Into<String>, settings: &ThrottleSettings) -> Self {
        Self {
            name: name.into(),
            max_concurrent: settings.max_concurrent,
            queue_size: settings.queue_size,
            permits: Arc::new(Semaphore::new(settings.max_concurrent)),
            queue_slots: Arc::new(Semaphore::new(settings.queue_size)),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            peak_active: AtomicUsize::new(0),
            peak_queued: AtomicUsize::new(0),
        }
    }

    /// Run `op` under the concurrency cap.
    ///
    /// Fast path takes a permit directly. When all permits are held the
    /// request occupies a waiting-room slot for the duration of the wait;
    /// no slot free means `QueueFull`.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ScreenshotError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ScreenshotError>>,
    {
        self.total.fetch_add(1, Ordering::Relaxed);

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let slot = match self.queue_slots.clone().try_acquire_owned() {
                    Ok(slot) => slot,
                    Err(_) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            throttle = %self.name,
                            active = self.active.load(Ordering::Relaxed),
                            queued = self.queued.load(Ordering::Relaxed),
                            "rejecting request, queue full"
                        );
                        return Err(ScreenshotError::QueueFull);
                    }
                };

                let queued = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
                self.peak_queued.fetch_max(queued, Ordering::Relaxed);
                debug!(throttle = %self.name, queued, "request queued");

                let permit = self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(ScreenshotError::from)?;

                self.queued.fetch_sub(1, Ordering::Relaxed);
                drop(slot);
                permit
            }
        };

        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_active.fetch_max(active, Ordering::Relaxed);

        let result = op().await;

        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        drop(permit);

        result
    }

    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            max_concurrent: self.max_concurrent,
            queue_size: self.queue_size,
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            total_requests: self.total.load(Ordering::Relaxed),
            completed_requests: self.completed.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            peak_queued: self.peak_queued.load(Ordering::Relaxed),
        }
    }
}
