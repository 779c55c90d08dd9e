//! Batch engine: submission, scheduling, workers and webhooks
//!
//! Jobs are admitted through per-user token buckets, wait on the store's
//! priority or scheduled heap, and are processed by per-job workers with
//! bounded item parallelism. Recurring jobs enqueue their successor when
//! they fire; terminal jobs notify an optional webhook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{CaptureRequest, SharedSettings};
use crate::error::ScreenshotError;
use crate::job::{
    BatchConfig, BatchJob, JobResults, JobSnapshot, JobStatus, JobStore, RecurrencePattern,
};
use crate::rate_limit::{RateLimiter, UserTier};
use crate::screenshot_service::ScreenshotService;

/// Scheduler wake period.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Per-item retry budget for timeouts and browser-context errors.
const ITEM_MAX_ATTEMPTS: usize = 3;

/// Webhook request timeout (per HTTP request).
const WEBHOOK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall webhook deadline including connection setup.
const WEBHOOK_DEADLINE: Duration = Duration::from_secs(15);

/// Worker drain budget during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// One entry of a batch submission.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub id: String,
    #[serde(flatten)]
    pub request: CaptureRequest,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchServiceStats {
    pub jobs: usize,
    pub scheduled: usize,
    pub running_workers: usize,
}

pub struct BatchService {
    settings: SharedSettings,
    store: Arc<JobStore>,
    service: Arc<ScreenshotService>,
    http: reqwest::Client,
    workers: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    rate_limiters: tokio::sync::Mutex<HashMap<String, Arc<RateLimiter>>>,
    scheduler: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicUsize>,
    accepting: AtomicBool,
}

impl BatchService {
    pub fn new(
        settings: SharedSettings,
        store: Arc<JobStore>,
        service: Arc<ScreenshotService>,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            settings,
            store,
            service,
            http,
            workers: tokio::sync::Mutex::new(HashMap::new()),
            rate_limiters: tokio::sync::Mutex::new(HashMap::new()),
            scheduler: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
        })
    }

    /// Start the 1-second scheduler loop.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.scheduler.lock().await;
        if guard.is_some() {
            return;
        }
        let service = self.clone();
        *guard = Some(tokio::spawn(async move {
            info!("batch scheduler started");
            loop {
                service.scheduler_pass().await;
                sleep(SCHEDULER_TICK).await;
            }
        }));
    }

    /// Submit a batch job.
    pub async fn submit(
        &self,
        items: Vec<BatchItem>,
        config: BatchConfig,
        user_id: Option<String>,
    ) -> Result<JobSnapshot, ScreenshotError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(ScreenshotError::Internal("batch service is shutting down".into()));
        }

        if items.is_empty() {
            return Err(ScreenshotError::InvalidInput(
                "batch requires at least 1 item".into(),
            ));
        }
        if items.len() > 50 {
            return Err(ScreenshotError::InvalidInput(format!(
                "batch of {} items exceeds the limit of 50",
                items.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for item in &items {
            if item.id.is_empty() {
                return Err(ScreenshotError::InvalidInput("item id must not be empty".into()));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(ScreenshotError::InvalidInput(format!(
                    "duplicate item id '{}'",
                    item.id
                )));
            }
            item.request.validate()?;
        }

        let scheduled_time = config.validate()?;

        if let Some(user_id) = &user_id {
            let limiter = self.limiter_for(user_id).await;
            if !limiter.acquire(items.len() as f64).await {
                warn!(user_id = %user_id, "batch submission rate limited");
                return Err(ScreenshotError::RateLimited(format!(
                    "rate limit exceeded for user {user_id}"
                )));
            }
        }

        let mut config = config;
        config.user_id = user_id;
        let job = BatchJob::new(
            items
                .into_iter()
                .map(|item| (item.id, item.request))
                .collect(),
            config,
            scheduled_time,
            None,
        );
        let snapshot = job.status_snapshot();
        info!(
            job_id = %snapshot.job_id,
            items = snapshot.counts.total,
            scheduled = scheduled_time.is_some(),
            "batch job accepted"
        );
        self.store.insert(job).await?;
        Ok(snapshot)
    }

    async fn limiter_for(&self, user_id: &str) -> Arc<RateLimiter> {
        let mut limiters = self.rate_limiters.lock().await;
        limiters
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let tier = if user_id.starts_with("enterprise-") {
                    UserTier::Enterprise
                } else if user_id.starts_with("premium-") {
                    UserTier::Premium
                } else if user_id.starts_with("basic-") {
                    UserTier::Basic
                } else {
                    UserTier::Free
                };
                Arc::new(RateLimiter::for_tier(tier))
            })
            .clone()
    }

    pub async fn get_job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.store.get(job_id).await.map(|j| j.status_snapshot())
    }

    pub async fn get_job_results(&self, job_id: &str) -> Option<JobResults> {
        self.store.get(job_id).await.map(|j| j.results())
    }

    /// Cancel a job: running workers are aborted, every non-terminal item
    /// is failed with "Job cancelled", and the job goes terminal.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let Some(job) = self.store.get(job_id).await else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }

        // A job still waiting on the scheduled heap just disappears
        if job.status == JobStatus::Scheduled {
            return self.store.remove(job_id).await;
        }

        if let Some(worker) = self.workers.lock().await.remove(job_id) {
            worker.abort();
            self.running.fetch_sub(1, Ordering::Relaxed);
        }

        self.store
            .with_job_mut(job_id, |job| job.cancel())
            .await
            .is_some()
    }

    /// Move a job to a new future fire time.
    pub async fn schedule_job(
        &self,
        job_id: &str,
        iso_time: &str,
    ) -> Result<Option<JobSnapshot>, ScreenshotError> {
        let fire = DateTime::parse_from_rfc3339(iso_time)
            .map_err(|e| {
                ScreenshotError::InvalidInput(format!("invalid scheduled_time '{iso_time}': {e}"))
            })?
            .with_timezone(&Utc);
        if fire <= Utc::now() {
            return Err(ScreenshotError::InvalidInput(format!(
                "scheduled_time '{iso_time}' is not in the future"
            )));
        }

        if !self.store.reschedule(job_id, fire).await {
            return Ok(None);
        }
        Ok(self.get_job(job_id).await)
    }

    /// Update a job's recurrence settings.
    pub async fn set_recurrence(
        &self,
        job_id: &str,
        pattern: RecurrencePattern,
        interval: u32,
        count: u32,
        cron: Option<String>,
    ) -> Result<Option<JobSnapshot>, ScreenshotError> {
        if pattern == RecurrencePattern::Custom {
            return Err(ScreenshotError::InvalidInput(
                "custom cron recurrence is not supported".into(),
            ));
        }
        if interval == 0 {
            return Err(ScreenshotError::InvalidInput(
                "recurrence_interval must be at least 1".into(),
            ));
        }

        let updated = self
            .store
            .with_job_mut(job_id, |job| {
                job.config.recurrence = pattern;
                job.config.recurrence_interval = interval;
                job.config.recurrence_count = count;
                job.config.recurrence_cron = cron;
                job.compute_next_scheduled_time();
                job.updated_at = Utc::now();
            })
            .await;

        match updated {
            Some(()) => Ok(self.get_job(job_id).await),
            None => Ok(None),
        }
    }

    /// One scheduler tick: fire due jobs (creating recurrence successors)
    /// and launch workers while capacity allows.
    async fn scheduler_pass(self: &Arc<Self>) {
        let now = Utc::now();

        for job_id in self.store.pop_due(now).await {
            self.spawn_successor_if_recurring(&job_id).await;
            self.store.enqueue_pending(&job_id).await;
            debug!(job_id = %job_id, "scheduled job fired");
        }

        let max_jobs = self.settings.snapshot().batch.max_concurrent_jobs;
        while self.running.load(Ordering::Relaxed) < max_jobs {
            let Some(job_id) = self.store.pop_pending().await else {
                break;
            };
            self.spawn_worker(job_id).await;
        }

        self.reap_finished_workers().await;
    }

    /// Create and schedule the next occurrence of a recurring job.
    async fn spawn_successor_if_recurring(&self, job_id: &str) {
        let Some(job) = self.store.get(job_id).await else {
            return;
        };
        if job.config.recurrence == RecurrencePattern::None {
            return;
        }
        let Some(next_fire) = job.next_scheduled_time else {
            return;
        };

        if job.config.recurrence_count > 0 {
            let occurrences = self.store.recurrence_chain_len(job_id).await;
            if occurrences >= job.config.recurrence_count {
                info!(
                    job_id,
                    occurrences, "recurrence count reached, no successor created"
                );
                return;
            }
        }

        let mut config = job.config.clone();
        config.scheduled_time = Some(next_fire.to_rfc3339());
        let successor = BatchJob::new(
            job.items
                .iter()
                .map(|item| (item.id.clone(), item.request.clone()))
                .collect(),
            config,
            Some(next_fire),
            Some(job.job_id.clone()),
        );
        let successor_id = successor.job_id.clone();

        match self.store.insert(successor).await {
            Ok(()) => info!(
                parent = job_id,
                successor = %successor_id,
                fire = %next_fire.to_rfc3339(),
                "recurrence successor scheduled"
            ),
            Err(e) => warn!(parent = job_id, error = %e, "failed to store recurrence successor"),
        }
    }

    async fn spawn_worker(self: &Arc<Self>, job_id: String) {
        self.running.fetch_add(1, Ordering::Relaxed);
        let service = self.clone();
        let id = job_id.clone();
        let handle = tokio::spawn(async move {
            service.process_job(&id).await;
        });
        self.workers.lock().await.insert(job_id, handle);
    }

    async fn reap_finished_workers(&self) {
        let mut workers = self.workers.lock().await;
        let finished: Vec<String> = workers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            workers.remove(&id);
        }
    }

    /// Per-job worker: items run under a `parallel`-wide semaphore, with
    /// fail-fast cutting the rest off at the first failure.
    async fn process_job(self: &Arc<Self>, job_id: &str) {
        let Some(job) = self.store.get(job_id).await else {
            self.running.fetch_sub(1, Ordering::Relaxed);
            return;
        };
        let parallel = job.config.parallel;
        let per_item = Duration::from_secs(job.config.timeout);
        let fail_fast = job.config.fail_fast;
        let use_cache = job.config.use_cache;

        self.store
            .with_job_mut(job_id, |job| job.start_processing())
            .await;

        let semaphore = Arc::new(Semaphore::new(parallel));
        let mut tasks: JoinSet<(String, bool)> = JoinSet::new();
        for item in &job.items {
            let service = self.clone();
            let semaphore = semaphore.clone();
            let job_id = job_id.to_string();
            let item_id = item.id.clone();
            let request = item.request.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                let ok = service
                    .process_item(&job_id, &item_id, request, per_item, use_cache)
                    .await;
                (item_id, ok)
            });
        }

        let mut aborted = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((item_id, success)) => {
                    if !success && fail_fast && !aborted {
                        warn!(job_id, item_id = %item_id, "fail-fast triggered, cancelling remaining items");
                        tasks.abort_all();
                        aborted = true;
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(job_id, error = %e, "item task panicked"),
            }
        }

        self.store
            .with_job_mut(job_id, |job| {
                if aborted {
                    for item in &mut job.items {
                        if !item.is_terminal() {
                            item.fail("Job cancelled");
                        }
                    }
                }
                job.update();
            })
            .await;

        if let Some(job) = self.store.get(job_id).await {
            if job.status.is_terminal() {
                self.send_webhook(&job).await;
            }
        }
        self.running.fetch_sub(1, Ordering::Relaxed);
        info!(job_id, "batch job worker finished");
    }

    /// Process one item with retries for timeouts and browser-context
    /// loss; other failures are final.
    async fn process_item(
        &self,
        job_id: &str,
        item_id: &str,
        request: CaptureRequest,
        per_item: Duration,
        use_cache: bool,
    ) -> bool {
        self.store
            .with_job_mut(job_id, |job| {
                if let Some(item) = job.item_mut(item_id) {
                    item.start();
                }
                job.update();
            })
            .await;

        let mut request = request;
        request.use_cache = use_cache;

        let mut attempt = 0usize;
        let mut delay = Duration::from_secs(1);
        let mut last_error = String::from("unknown error");

        while attempt < ITEM_MAX_ATTEMPTS {
            match timeout(per_item, self.service.capture(request.clone())).await {
                Ok(Ok(outcome)) => {
                    let processing = self
                        .store
                        .with_job_mut(job_id, |job| {
                            let processing = job.item_mut(item_id).and_then(|item| {
                                item.complete(outcome.url.clone(), outcome.cached);
                                item.processing
                            });
                            job.update();
                            processing
                        })
                        .await
                        .flatten();
                    debug!(
                        job_id,
                        item_id = %item_id,
                        cached = outcome.cached,
                        processing = ?processing,
                        "item completed"
                    );
                    return true;
                }
                Err(_) => {
                    last_error = format!("screenshot capture timed out after {per_item:?}");
                    warn!(
                        job_id,
                        item_id,
                        attempt = attempt + 1,
                        "item timed out, backing off"
                    );
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    let context_loss = message.contains("has been closed")
                        || message.contains("Target page, context or browser has been closed")
                        || message.to_lowercase().contains("target closed");
                    if !context_loss {
                        self.store
                            .with_job_mut(job_id, |job| {
                                if let Some(item) = job.item_mut(item_id) {
                                    item.fail(message.clone());
                                }
                                job.update();
                            })
                            .await;
                        return false;
                    }
                    last_error = format!("browser context error: {message}");
                    warn!(
                        job_id,
                        item_id,
                        attempt = attempt + 1,
                        error = %message,
                        "browser context lost, backing off"
                    );
                }
            }

            attempt += 1;
            if attempt >= ITEM_MAX_ATTEMPTS {
                break;
            }
            sleep(delay).await;
            delay *= 2;
        }

        self.store
            .with_job_mut(job_id, |job| {
                if let Some(item) = job.item_mut(item_id) {
                    item.fail(last_error.clone());
                }
                job.update();
            })
            .await;
        false
    }

    /// Deliver the results payload; failures are logged and never affect
    /// the job.
    async fn send_webhook(&self, job: &BatchJob) {
        let Some(webhook_url) = job.config.webhook.clone() else {
            debug!(job_id = %job.job_id, "no webhook configured");
            return;
        };

        let payload = job.results();
        let mut request = self
            .http
            .post(&webhook_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&payload);
        if let Some(auth) = &job.config.webhook_auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth.clone());
        }

        info!(job_id = %job.job_id, webhook = %webhook_url, "sending webhook notification");
        match timeout(WEBHOOK_DEADLINE, request.send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_server_error() {
                    error!(job_id = %job.job_id, %status, "webhook failed with server error");
                } else if status.is_client_error() {
                    warn!(job_id = %job.job_id, %status, "webhook failed with client error");
                } else {
                    info!(job_id = %job.job_id, %status, "webhook delivered");
                }
            }
            Ok(Err(e)) => {
                error!(job_id = %job.job_id, error = %e, "webhook request error");
            }
            Err(_) => {
                error!(job_id = %job.job_id, deadline = ?WEBHOOK_DEADLINE, "webhook timed out");
            }
        }
    }

    pub async fn stats(&self) -> BatchServiceStats {
        BatchServiceStats {
            jobs: self.store.len().await,
            scheduled: self.store.scheduled_count().await,
            running_workers: self.running.load(Ordering::Relaxed),
        }
    }

    /// Stop admission, the scheduler, then workers with a bounded drain.
    pub async fn shutdown(&self) {
        info!("shutting down batch service");
        self.accepting.store(false, Ordering::Relaxed);

        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.abort();
        }

        let workers: Vec<(String, JoinHandle<()>)> =
            self.workers.lock().await.drain().collect();
        let drain = async {
            for (job_id, handle) in workers {
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(job_id, error = %e, "worker ended abnormally during shutdown");
                    }
                }
            }
        };
        if timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            warn!("worker drain exceeded shutdown budget");
        }
        info!("batch service shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageFormat;

    fn item(id: &str, url: &str) -> BatchItem {
        BatchItem {
            id: id.to_string(),
            request: CaptureRequest::new(url, 1280, 720, ImageFormat::Png),
        }
    }

    #[test]
    fn batch_item_deserializes_flattened() {
        let parsed: BatchItem = serde_json::from_str(
            r#"{"id":"a","url":"https://example.com","width":800,"height":600,"format":"png","use_cache":true}"#,
        )
        .unwrap();
        assert_eq!(parsed.id, "a");
        assert_eq!(parsed.request.width, 800);
    }

    // Submission validation runs before any worker exists, so it is
    // testable without wiring the full service; end-to-end batch flows
    // live in the crate-level tests.
    #[test]
    fn item_helpers_build_requests() {
        let i = item("a", "https://example.com");
        assert!(i.request.validate().is_ok());
    }
}
