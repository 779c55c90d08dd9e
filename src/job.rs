//! Batch job model: items, jobs, queues and the job store
//!
//! A `BatchJob` owns its `JobItem`s and derives its own status from
//! theirs. Jobs wait either on a priority heap (ready work, ordered by
//! priority rank then enqueue order) or a time heap (scheduled work,
//! ordered by fire time). The `JobStore` owns every job and evicts
//! terminal ones on a TTL.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::CaptureRequest;
use crate::error::ScreenshotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// Heap rank: lower pops first.
    pub fn rank(&self) -> u8 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    None,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl RecurrencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrencePattern::None => "none",
            RecurrencePattern::Hourly => "hourly",
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

/// One screenshot request within a batch job.
#[derive(Debug, Clone)]
pub struct JobItem {
    pub id: String,
    pub request: CaptureRequest,
    pub status: ItemStatus,
    pub result_url: Option<String>,
    pub cached: bool,
    pub error: Option<String>,
    pub started_at: Option<Instant>,
    pub processing: Option<Duration>,
}

impl JobItem {
    pub fn new(id: String, request: CaptureRequest) -> Self {
        Self {
            id,
            request,
            status: ItemStatus::Pending,
            result_url: None,
            cached: false,
            error: None,
            started_at: None,
            processing: None,
        }
    }

    pub fn start(&mut self) {
        self.status = ItemStatus::Processing;
        self.started_at = Some(Instant::now());
    }

    pub fn complete(&mut self, url: String, cached: bool) {
        self.status = ItemStatus::Success;
        self.result_url = Some(url);
        self.cached = cached;
        self.processing = self.started_at.map(|t| t.elapsed());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ItemStatus::Error;
        self.error = Some(error.into());
        self.processing = self.started_at.map(|t| t.elapsed());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ItemStatus::Success | ItemStatus::Error)
    }
}

fn default_parallel() -> usize {
    3
}
fn default_timeout() -> u64 {
    30
}
fn default_use_cache() -> bool {
    true
}
fn default_priority() -> JobPriority {
    JobPriority::Normal
}
fn default_recurrence() -> RecurrencePattern {
    RecurrencePattern::None
}
fn default_interval() -> u32 {
    1
}

/// Batch processing configuration, validated at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Per-item deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub webhook_auth: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: JobPriority,
    /// ISO-8601 fire time; present means the job starts scheduled
    #[serde(default)]
    pub scheduled_time: Option<String>,
    #[serde(default = "default_recurrence")]
    pub recurrence: RecurrencePattern,
    #[serde(default = "default_interval")]
    pub recurrence_interval: u32,
    /// Total occurrences; 0 means unbounded
    #[serde(default)]
    pub recurrence_count: u32,
    #[serde(default)]
    pub recurrence_cron: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            timeout: default_timeout(),
            fail_fast: false,
            use_cache: true,
            webhook: None,
            webhook_auth: None,
            priority: default_priority(),
            scheduled_time: None,
            recurrence: default_recurrence(),
            recurrence_interval: default_interval(),
            recurrence_count: 0,
            recurrence_cron: None,
            user_id: None,
        }
    }
}

impl BatchConfig {
    /// Validate bounds and parse the scheduled time.
    pub fn validate(&self) -> Result<Option<DateTime<Utc>>, ScreenshotError> {
        if self.parallel == 0 || self.parallel > 10 {
            return Err(ScreenshotError::InvalidInput(format!(
                "parallel {} out of range 1-10",
                self.parallel
            )));
        }
        if !(5..=60).contains(&self.timeout) {
            return Err(ScreenshotError::InvalidInput(format!(
                "timeout {}s out of range 5-60",
                self.timeout
            )));
        }
        if self.recurrence == RecurrencePattern::Custom {
            return Err(ScreenshotError::InvalidInput(
                "custom cron recurrence is not supported; use hourly, daily, weekly or monthly"
                    .into(),
            ));
        }
        if self.recurrence_interval == 0 {
            return Err(ScreenshotError::InvalidInput(
                "recurrence_interval must be at least 1".into(),
            ));
        }

        match &self.scheduled_time {
            None => Ok(None),
            Some(raw) => {
                let parsed = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                    ScreenshotError::InvalidInput(format!("invalid scheduled_time '{raw}': {e}"))
                })?;
                let parsed = parsed.with_timezone(&Utc);
                if parsed <= Utc::now() {
                    return Err(ScreenshotError::InvalidInput(format!(
                        "scheduled_time '{raw}' is not in the future"
                    )));
                }
                Ok(Some(parsed))
            }
        }
    }
}

/// A batch of screenshot requests processed as one unit.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub job_id: String,
    pub items: Vec<JobItem>,
    pub config: BatchConfig,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub started_at: Option<Instant>,
    pub total_processing: Option<Duration>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub next_scheduled_time: Option<DateTime<Utc>>,
    pub parent_job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ItemCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub success: usize,
    pub error: usize,
}

impl BatchJob {
    pub fn new(
        items: Vec<(String, CaptureRequest)>,
        config: BatchConfig,
        scheduled_time: Option<DateTime<Utc>>,
        parent_job_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let job_id = format!("batch-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let status = if scheduled_time.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Pending
        };

        let mut job = Self {
            job_id,
            items: items
                .into_iter()
                .map(|(id, request)| JobItem::new(id, request))
                .collect(),
            config,
            status,
            created_at: now,
            updated_at: now,
            completed_at: None,
            started_at: None,
            total_processing: None,
            scheduled_time,
            next_scheduled_time: None,
            parent_job_id,
        };
        job.compute_next_scheduled_time();
        job
    }

    pub fn item(&self, id: &str) -> Option<&JobItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn item_mut(&mut self, id: &str) -> Option<&mut JobItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    pub fn counts(&self) -> ItemCounts {
        let mut counts = ItemCounts {
            total: self.items.len(),
            ..Default::default()
        };
        for item in &self.items {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Success => counts.success += 1,
                ItemStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    pub fn start_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Instant::now());
        self.updated_at = Utc::now();
    }

    /// Recompute job status and timestamps from item states.
    ///
    /// Cancelled is sticky; update never resurrects a cancelled job.
    pub fn update(&mut self) {
        self.updated_at = Utc::now();
        if self.status == JobStatus::Cancelled {
            return;
        }

        let counts = self.counts();
        if counts.total == 0 {
            self.status = JobStatus::Failed;
            return;
        }

        if counts.pending == 0 && counts.processing == 0 {
            self.status = if counts.error > 0 {
                if counts.success > 0 {
                    JobStatus::CompletedWithErrors
                } else {
                    JobStatus::Failed
                }
            } else {
                JobStatus::Completed
            };

            if self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
                self.total_processing = self.started_at.map(|t| t.elapsed());
            }
        } else if self.started_at.is_some() {
            self.status = JobStatus::Processing;
        }
    }

    /// Mark every non-terminal item failed and the job cancelled.
    pub fn cancel(&mut self) {
        for item in &mut self.items {
            if !item.is_terminal() {
                item.fail("Job cancelled");
            }
        }
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
            self.total_processing = self.started_at.map(|t| t.elapsed());
        }
    }

    /// Next fire time from the recurrence pattern.
    ///
    /// The base is the later of the scheduled time and now, so overdue
    /// recurring jobs don't pile up in the past. Monthly arithmetic
    /// clamps to the target month's last day.
    pub fn compute_next_scheduled_time(&mut self) {
        let Some(scheduled) = self.scheduled_time else {
            self.next_scheduled_time = None;
            return;
        };
        let base = scheduled.max(Utc::now());
        let interval = self.config.recurrence_interval as i64;

        self.next_scheduled_time = match self.config.recurrence {
            RecurrencePattern::None | RecurrencePattern::Custom => None,
            RecurrencePattern::Hourly => Some(base + chrono::Duration::hours(interval)),
            RecurrencePattern::Daily => Some(base + chrono::Duration::days(interval)),
            RecurrencePattern::Weekly => Some(base + chrono::Duration::weeks(interval)),
            RecurrencePattern::Monthly => {
                base.checked_add_months(Months::new(self.config.recurrence_interval))
            }
        };
    }

    /// Snapshot served by `get_job`.
    pub fn status_snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            status: self.status,
            priority: self.config.priority,
            counts: self.counts(),
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
            completed_at: self.completed_at.map(|t| t.to_rfc3339()),
            scheduled_time: self.scheduled_time.map(|t| t.to_rfc3339()),
            next_scheduled_time: self.next_scheduled_time.map(|t| t.to_rfc3339()),
            recurrence: match self.config.recurrence {
                RecurrencePattern::None => None,
                other => Some(other.as_str().to_string()),
            },
            parent_job_id: self.parent_job_id.clone(),
        }
    }

    /// Webhook / results payload. Field layout is a wire contract.
    pub fn results(&self) -> JobResults {
        let counts = self.counts();
        let processing_time = self
            .total_processing
            .map(|d| (d.as_secs_f64() * 100.0).round() / 100.0)
            .unwrap_or(0.0);

        JobResults {
            job_id: self.job_id.clone(),
            status: self.status,
            priority: self.config.priority,
            total: counts.total,
            succeeded: counts.success,
            failed: counts.error,
            processing_time,
            scheduled_time: self.scheduled_time.map(|t| t.to_rfc3339()),
            recurrence: match self.config.recurrence {
                RecurrencePattern::None => None,
                other => Some(other.as_str().to_string()),
            },
            results: self
                .items
                .iter()
                .map(|item| ItemResult {
                    id: item.id.clone(),
                    status: item.status,
                    url: item.result_url.clone(),
                    error: item.error.clone(),
                    cached: if item.status == ItemStatus::Success {
                        Some(item.cached)
                    } else {
                        None
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub counts: ItemCounts,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub scheduled_time: Option<String>,
    pub next_scheduled_time: Option<String>,
    pub recurrence: Option<String>,
    pub parent_job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResults {
    pub job_id: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub processing_time: f64,
    pub scheduled_time: Option<String>,
    pub recurrence: Option<String>,
    pub results: Vec<ItemResult>,
}

/// Heap key: (priority rank, enqueue sequence). The sequence preserves
/// FIFO order within one priority level.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityEntry {
    rank: u8,
    seq: u64,
    job_id: String,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<String, BatchJob>,
    pending: BinaryHeap<Reverse<PriorityEntry>>,
    scheduled: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    seq: u64,
    last_cleanup: Option<Instant>,
}

/// Owns every job; all job and item mutations go through its mutex.
pub struct JobStore {
    max_jobs: usize,
    ttl: Duration,
    inner: Mutex<StoreInner>,
}

/// Opportunistic store cleanup runs at most hourly.
const STORE_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

impl JobStore {
    pub fn new(max_jobs: usize, ttl: Duration) -> Self {
        Self {
            max_jobs,
            ttl,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Insert a job onto the appropriate queue.
    pub async fn insert(&self, job: BatchJob) -> Result<(), ScreenshotError> {
        let mut inner = self.inner.lock().await;
        self.maybe_cleanup(&mut inner);

        if inner.jobs.len() >= self.max_jobs {
            Self::evict_terminal(&mut inner, self.ttl);
            if inner.jobs.len() >= self.max_jobs {
                return Err(ScreenshotError::RateLimited(format!(
                    "job store full ({} jobs)",
                    inner.jobs.len()
                )));
            }
        }

        match (job.status, job.scheduled_time) {
            (JobStatus::Scheduled, Some(fire)) => {
                inner.scheduled.push(Reverse((fire, job.job_id.clone())));
            }
            _ => {
                let entry = PriorityEntry {
                    rank: job.config.priority.rank(),
                    seq: inner.seq,
                    job_id: job.job_id.clone(),
                };
                inner.seq += 1;
                inner.pending.push(Reverse(entry));
            }
        }
        debug!(job_id = %job.job_id, status = ?job.status, "job stored");
        inner.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Option<BatchJob> {
        self.inner.lock().await.jobs.get(job_id).cloned()
    }

    /// Apply a mutation to a stored job; returns the closure result, or
    /// None when the job is unknown.
    pub async fn with_job_mut<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut BatchJob) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().await;
        inner.jobs.get_mut(job_id).map(f)
    }

    /// Pop the highest-priority pending job id.
    pub async fn pop_pending(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        while let Some(Reverse(entry)) = inner.pending.pop() {
            // Heap entries may be stale after cancellation/eviction
            match inner.jobs.get(&entry.job_id) {
                Some(job) if job.status == JobStatus::Pending => return Some(entry.job_id),
                _ => continue,
            }
        }
        None
    }

    /// Pop every scheduled job due at or before `now`.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let mut due = Vec::new();
        while let Some(Reverse((fire, _))) = inner.scheduled.peek() {
            if *fire > now {
                break;
            }
            let Reverse((_, job_id)) = inner.scheduled.pop().expect("peeked entry");
            if inner
                .jobs
                .get(&job_id)
                .map(|j| j.status == JobStatus::Scheduled)
                .unwrap_or(false)
            {
                due.push(job_id);
            }
        }
        due
    }

    /// Move a job to the pending queue (used when a scheduled job fires).
    pub async fn enqueue_pending(&self, job_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return;
        };
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();
        let entry = PriorityEntry {
            rank: job.config.priority.rank(),
            seq: inner.seq,
            job_id: job_id.to_string(),
        };
        inner.seq += 1;
        inner.pending.push(Reverse(entry));
    }

    /// Re-schedule an existing job to a new fire time.
    pub async fn reschedule(&self, job_id: &str, fire: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return false;
        };
        if job.status.is_terminal() || job.status == JobStatus::Processing {
            return false;
        }
        job.status = JobStatus::Scheduled;
        job.scheduled_time = Some(fire);
        job.compute_next_scheduled_time();
        job.updated_at = Utc::now();
        inner.scheduled.push(Reverse((fire, job_id.to_string())));
        true
    }

    pub async fn remove(&self, job_id: &str) -> bool {
        self.inner.lock().await.jobs.remove(job_id).is_some()
    }

    /// Occurrence count along the parent chain, this job included.
    pub async fn recurrence_chain_len(&self, job_id: &str) -> u32 {
        let inner = self.inner.lock().await;
        let mut count = 1u32;
        let mut current = inner.jobs.get(job_id).and_then(|j| j.parent_job_id.clone());
        while let Some(parent_id) = current {
            match inner.jobs.get(&parent_id) {
                Some(parent) => {
                    count += 1;
                    current = parent.parent_job_id.clone();
                }
                None => break,
            }
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }

    pub async fn job_ids(&self) -> Vec<String> {
        self.inner.lock().await.jobs.keys().cloned().collect()
    }

    /// Count of scheduled-and-waiting jobs.
    pub async fn scheduled_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Scheduled)
            .count()
    }

    fn maybe_cleanup(&self, inner: &mut StoreInner) {
        let due = inner
            .last_cleanup
            .map(|t| t.elapsed() > STORE_CLEANUP_INTERVAL)
            .unwrap_or(true);
        if due {
            inner.last_cleanup = Some(Instant::now());
            Self::evict_terminal(inner, self.ttl);
        }
    }

    fn evict_terminal(inner: &mut StoreInner, ttl: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        let removed = before - inner.jobs.len();
        if removed > 0 {
            debug!(removed, "evicted expired terminal jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageFormat;
    use chrono::TimeZone;

    fn request(url: &str) -> CaptureRequest {
        CaptureRequest::new(url, 1280, 720, ImageFormat::Png)
    }

    fn simple_job(priority: JobPriority) -> BatchJob {
        BatchJob::new(
            vec![("item-1".into(), request("https://example.com"))],
            BatchConfig {
                priority,
                ..Default::default()
            },
            None,
            None,
        )
    }

    #[test]
    fn config_validation_bounds() {
        let mut config = BatchConfig::default();
        assert!(config.validate().is_ok());

        config.parallel = 0;
        assert!(config.validate().is_err());
        config.parallel = 11;
        assert!(config.validate().is_err());
        config.parallel = 10;
        assert!(config.validate().is_ok());

        config.timeout = 4;
        assert!(config.validate().is_err());
        config.timeout = 61;
        assert!(config.validate().is_err());
        config.timeout = 60;
        assert!(config.validate().is_ok());

        config.recurrence = RecurrencePattern::Custom;
        config.recurrence_cron = Some("0 * * * *".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn scheduled_time_must_be_future_iso8601() {
        let mut config = BatchConfig {
            scheduled_time: Some("not-a-date".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.scheduled_time = Some("2001-01-01T00:00:00Z".into());
        assert!(config.validate().is_err());

        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        config.scheduled_time = Some(future);
        assert!(config.validate().unwrap().is_some());
    }

    #[test]
    fn job_status_follows_items() {
        let mut job = BatchJob::new(
            vec![
                ("a".into(), request("https://a.com")),
                ("b".into(), request("https://b.com")),
            ],
            BatchConfig::default(),
            None,
            None,
        );
        assert_eq!(job.status, JobStatus::Pending);

        job.start_processing();
        job.item_mut("a").unwrap().start();
        job.update();
        assert_eq!(job.status, JobStatus::Processing);

        job.item_mut("a").unwrap().complete("url-a".into(), false);
        job.item_mut("b").unwrap().start();
        job.item_mut("b").unwrap().fail("boom");
        job.update();
        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert!(job.completed_at.is_some());

        let counts = job.counts();
        assert_eq!(counts.success, 1);
        assert_eq!(counts.error, 1);
    }

    #[test]
    fn all_failures_mean_failed() {
        let mut job = simple_job(JobPriority::Normal);
        job.start_processing();
        job.item_mut("item-1").unwrap().start();
        job.item_mut("item-1").unwrap().fail("no");
        job.update();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn cancel_marks_non_terminal_items() {
        let mut job = BatchJob::new(
            vec![
                ("a".into(), request("https://a.com")),
                ("b".into(), request("https://b.com")),
                ("c".into(), request("https://c.com")),
            ],
            BatchConfig::default(),
            None,
            None,
        );
        job.start_processing();
        job.item_mut("a").unwrap().start();
        job.item_mut("a").unwrap().complete("url".into(), false);
        job.item_mut("b").unwrap().start();

        job.cancel();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.item("a").unwrap().status, ItemStatus::Success);
        assert_eq!(job.item("b").unwrap().status, ItemStatus::Error);
        assert_eq!(job.item("b").unwrap().error.as_deref(), Some("Job cancelled"));
        assert_eq!(job.item("c").unwrap().error.as_deref(), Some("Job cancelled"));

        // update() must not resurrect a cancelled job
        job.update();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn monthly_recurrence_clamps_month_end() {
        let base = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        // Leap year: Jan 31 -> Feb 29
        assert_eq!(
            base.checked_add_months(Months::new(1)).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        // Non-leap: Jan 31 -> Feb 28
        let base = Utc.with_ymd_and_hms(2023, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(
            base.checked_add_months(Months::new(1)).unwrap(),
            Utc.with_ymd_and_hms(2023, 2, 28, 12, 0, 0).unwrap()
        );
        // And back to a 31st where the month has one
        assert_eq!(
            base.checked_add_months(Months::new(2)).unwrap(),
            Utc.with_ymd_and_hms(2023, 3, 31, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_fire_time_per_pattern() {
        let fire = Utc::now() + chrono::Duration::hours(2);
        let mut job = BatchJob::new(
            vec![("a".into(), request("https://a.com"))],
            BatchConfig {
                recurrence: RecurrencePattern::Daily,
                recurrence_interval: 2,
                ..Default::default()
            },
            Some(fire),
            None,
        );
        job.compute_next_scheduled_time();
        assert_eq!(job.next_scheduled_time.unwrap(), fire + chrono::Duration::days(2));

        job.config.recurrence = RecurrencePattern::Hourly;
        job.config.recurrence_interval = 3;
        job.compute_next_scheduled_time();
        assert_eq!(
            job.next_scheduled_time.unwrap(),
            fire + chrono::Duration::hours(3)
        );

        job.config.recurrence = RecurrencePattern::None;
        job.compute_next_scheduled_time();
        assert!(job.next_scheduled_time.is_none());
    }

    #[test]
    fn results_payload_shape() {
        let mut job = simple_job(JobPriority::High);
        job.start_processing();
        job.item_mut("item-1").unwrap().start();
        job.item_mut("item-1")
            .unwrap()
            .complete("https://signed.example/img".into(), true);
        job.update();

        let payload = serde_json::to_value(job.results()).unwrap();
        assert_eq!(payload["job_id"], job.job_id);
        assert_eq!(payload["status"], "completed");
        assert_eq!(payload["priority"], "high");
        assert_eq!(payload["total"], 1);
        assert_eq!(payload["succeeded"], 1);
        assert_eq!(payload["failed"], 0);
        assert!(payload["scheduled_time"].is_null());
        assert!(payload["recurrence"].is_null());
        assert_eq!(payload["results"][0]["id"], "item-1");
        assert_eq!(payload["results"][0]["status"], "success");
        assert_eq!(payload["results"][0]["url"], "https://signed.example/img");
        assert_eq!(payload["results"][0]["cached"], true);
        // Failed-item-only fields stay absent on success
        assert!(payload["results"][0].get("error").is_none());
    }

    #[tokio::test]
    async fn store_pops_by_priority_then_fifo() {
        let store = JobStore::new(10, Duration::from_secs(3600));
        let low = simple_job(JobPriority::Low);
        let normal = simple_job(JobPriority::Normal);
        let high = simple_job(JobPriority::High);
        let high2 = simple_job(JobPriority::High);

        let (low_id, normal_id, high_id, high2_id) = (
            low.job_id.clone(),
            normal.job_id.clone(),
            high.job_id.clone(),
            high2.job_id.clone(),
        );

        // Enqueue low first; high must still pop first
        store.insert(low).await.unwrap();
        store.insert(normal).await.unwrap();
        store.insert(high).await.unwrap();
        store.insert(high2).await.unwrap();

        assert_eq!(store.pop_pending().await.unwrap(), high_id);
        assert_eq!(store.pop_pending().await.unwrap(), high2_id);
        assert_eq!(store.pop_pending().await.unwrap(), normal_id);
        assert_eq!(store.pop_pending().await.unwrap(), low_id);
        assert!(store.pop_pending().await.is_none());
    }

    #[tokio::test]
    async fn store_pops_due_scheduled_jobs() {
        let store = JobStore::new(10, Duration::from_secs(3600));
        let soon = Utc::now() + chrono::Duration::milliseconds(10);
        let later = Utc::now() + chrono::Duration::hours(1);

        let due_job = BatchJob::new(
            vec![("a".into(), request("https://a.com"))],
            BatchConfig::default(),
            Some(soon),
            None,
        );
        let future_job = BatchJob::new(
            vec![("b".into(), request("https://b.com"))],
            BatchConfig::default(),
            Some(later),
            None,
        );
        let due_id = due_job.job_id.clone();

        store.insert(due_job).await.unwrap();
        store.insert(future_job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let due = store.pop_due(Utc::now()).await;
        assert_eq!(due, vec![due_id]);
        assert!(store.pop_due(Utc::now()).await.is_empty());
        assert_eq!(store.scheduled_count().await, 1);
    }

    #[tokio::test]
    async fn recurrence_chain_walks_parents() {
        let store = JobStore::new(10, Duration::from_secs(3600));
        let first = simple_job(JobPriority::Normal);
        let first_id = first.job_id.clone();
        store.insert(first).await.unwrap();

        let second = BatchJob::new(
            vec![("a".into(), request("https://a.com"))],
            BatchConfig::default(),
            None,
            Some(first_id.clone()),
        );
        let second_id = second.job_id.clone();
        store.insert(second).await.unwrap();

        assert_eq!(store.recurrence_chain_len(&first_id).await, 1);
        assert_eq!(store.recurrence_chain_len(&second_id).await, 2);
    }

    #[tokio::test]
    async fn full_store_rejects_after_eviction_fails() {
        let store = JobStore::new(2, Duration::from_secs(3600));
        store.insert(simple_job(JobPriority::Normal)).await.unwrap();
        store.insert(simple_job(JobPriority::Normal)).await.unwrap();
        // Both jobs are live (non-terminal), nothing to evict
        assert!(store.insert(simple_job(JobPriority::Normal)).await.is_err());
    }
}
