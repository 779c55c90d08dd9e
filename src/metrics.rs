//! Observability collector: counters, latency percentiles, error ring,
//! time series and threshold alerts
//!
//! Aggregates are read back through `get_metrics`, so everything lives
//! under one mutex: readers may observe a slightly stale snapshot but
//! never a torn one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;

use crate::browser_pool::BrowserPoolStats;
use crate::cache::ResultCacheStats;
use crate::content_cache::ContentCacheStats;
use crate::retry::RetryStatsSnapshot;
use crate::tab_pool::TabPoolStats;
use crate::throttle::ThrottleStats;

/// Response-time sliding window size.
const MAX_RESPONSE_SAMPLES: usize = 10_000;

/// Recent-error ring size.
const MAX_RECENT_ERRORS: usize = 100;

/// Per-series point cap; older points are pruned coarsely.
const MAX_SERIES_POINTS: usize = 10_000;

/// Minimum requests before the error-rate alert can fire.
const ALERT_MIN_REQUESTS: u64 = 20;

/// Cooldown between repeated alerts of one kind.
const ALERT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorRecord {
    pub error_type: String,
    pub endpoint: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    Latency,
    Memory,
    PoolUsage,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
}

pub type AlertHandler = Box<dyn Fn(&Alert) + Send + Sync>;

#[derive(Default)]
struct CollectorInner {
    requests_total: u64,
    requests_success: u64,
    requests_error: u64,
    errors_by_type: HashMap<String, u64>,
    errors_by_endpoint: HashMap<String, u64>,
    response_times_ms: VecDeque<f64>,
    recent_errors: VecDeque<ErrorRecord>,
    time_series: HashMap<(String, String), Vec<(DateTime<Utc>, f64)>>,
    pool: Option<BrowserPoolStats>,
    tabs: Option<TabPoolStats>,
    result_cache: Option<ResultCacheStats>,
    content_cache: Option<ContentCacheStats>,
    throttle: Option<ThrottleStats>,
    retry: HashMap<String, RetryStatsSnapshot>,
    last_alerts: HashMap<AlertKind, Instant>,
}

pub struct MetricsCollector {
    started: Instant,
    inner: Mutex<CollectorInner>,
    alert_handlers: StdMutex<Vec<AlertHandler>>,
}

impl MetricsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            inner: Mutex::new(CollectorInner::default()),
            alert_handlers: StdMutex::new(Vec::new()),
        })
    }

    pub async fn record_request(&self, endpoint: &str, status_code: u16, duration_ms: f64) {
        let mut inner = self.inner.lock().await;
        inner.requests_total += 1;
        if (200..400).contains(&status_code) {
            inner.requests_success += 1;
        } else {
            inner.requests_error += 1;
        }

        inner.response_times_ms.push_back(duration_ms);
        while inner.response_times_ms.len() > MAX_RESPONSE_SAMPLES {
            inner.response_times_ms.pop_front();
        }

        Self::push_point(
            &mut inner,
            "request",
            endpoint,
            duration_ms,
        );

        self.check_alerts(&mut inner);
    }

    pub async fn record_error(&self, error_type: &str, endpoint: &str, details: &str) {
        let mut inner = self.inner.lock().await;
        *inner.errors_by_type.entry(error_type.to_string()).or_insert(0) += 1;
        *inner
            .errors_by_endpoint
            .entry(endpoint.to_string())
            .or_insert(0) += 1;

        inner.recent_errors.push_back(ErrorRecord {
            error_type: error_type.to_string(),
            endpoint: endpoint.to_string(),
            details: details.to_string(),
            timestamp: Utc::now(),
        });
        while inner.recent_errors.len() > MAX_RECENT_ERRORS {
            inner.recent_errors.pop_front();
        }
    }

    pub async fn record_time_series(&self, metric_type: &str, name: &str, value: f64) {
        let mut inner = self.inner.lock().await;
        Self::push_point(&mut inner, metric_type, name, value);
    }

    fn push_point(inner: &mut CollectorInner, metric_type: &str, name: &str, value: f64) {
        let series = inner
            .time_series
            .entry((metric_type.to_string(), name.to_string()))
            .or_default();
        series.push((Utc::now(), value));
        if series.len() > MAX_SERIES_POINTS {
            let excess = series.len() - MAX_SERIES_POINTS;
            series.drain(..excess);
        }
    }

    pub async fn update_pool_stats(&self, stats: BrowserPoolStats) {
        let mut inner = self.inner.lock().await;
        inner.pool = Some(stats);
        self.check_alerts(&mut inner);
    }

    pub async fn update_tab_stats(&self, stats: TabPoolStats) {
        self.inner.lock().await.tabs = Some(stats);
    }

    pub async fn update_cache_stats(&self, result: ResultCacheStats, content: ContentCacheStats) {
        let mut inner = self.inner.lock().await;
        inner.result_cache = Some(result);
        inner.content_cache = Some(content);
    }

    pub async fn update_throttle_stats(&self, stats: ThrottleStats) {
        self.inner.lock().await.throttle = Some(stats);
    }

    pub async fn update_retry_stats(&self, name: &str, stats: RetryStatsSnapshot) {
        self.inner.lock().await.retry.insert(name.to_string(), stats);
    }

    pub fn register_alert_handler(&self, handler: AlertHandler) {
        self.alert_handlers
            .lock()
            .expect("alert handler lock poisoned")
            .push(handler);
    }

    fn check_alerts(&self, inner: &mut CollectorInner) {
        let mut alerts = Vec::new();

        if inner.requests_total >= ALERT_MIN_REQUESTS {
            let error_rate = inner.requests_error as f64 / inner.requests_total as f64;
            if error_rate > 0.05 {
                alerts.push(Alert {
                    kind: AlertKind::ErrorRate,
                    message: format!("error rate {:.1}% exceeds 5%", error_rate * 100.0),
                    value: error_rate,
                });
            }
        }

        let p95 = percentile(&inner.response_times_ms, 0.95);
        if p95 > 5000.0 {
            alerts.push(Alert {
                kind: AlertKind::Latency,
                message: format!("p95 latency {p95:.0}ms exceeds 5000ms"),
                value: p95,
            });
        }

        if let Some(memory_pct) = memory_usage_fraction() {
            if memory_pct > 0.9 {
                alerts.push(Alert {
                    kind: AlertKind::Memory,
                    message: format!("memory usage {:.0}% exceeds 90%", memory_pct * 100.0),
                    value: memory_pct,
                });
            }
        }

        if let Some(pool) = &inner.pool {
            if pool.utilization > 0.9 {
                alerts.push(Alert {
                    kind: AlertKind::PoolUsage,
                    message: format!(
                        "browser pool usage {:.0}% exceeds 90%",
                        pool.utilization * 100.0
                    ),
                    value: pool.utilization,
                });
            }
        }

        let now = Instant::now();
        let fired: Vec<Alert> = alerts
            .into_iter()
            .filter(|alert| {
                let due = inner
                    .last_alerts
                    .get(&alert.kind)
                    .map(|t| now.duration_since(*t) > ALERT_COOLDOWN)
                    .unwrap_or(true);
                if due {
                    inner.last_alerts.insert(alert.kind, now);
                }
                due
            })
            .collect();

        if fired.is_empty() {
            return;
        }
        let handlers = self.alert_handlers.lock().expect("alert handler lock poisoned");
        for alert in &fired {
            warn!(kind = ?alert.kind, message = %alert.message, "metrics alert");
            for handler in handlers.iter() {
                handler(alert);
            }
        }
    }

    /// Full metrics snapshot.
    pub async fn get_metrics(&self) -> serde_json::Value {
        self.get_metrics_sections(None).await
    }

    /// Metrics snapshot restricted to the named top-level sections.
    pub async fn get_metrics_sections(&self, sections: Option<&[&str]>) -> serde_json::Value {
        let full = self.snapshot().await;
        match sections {
            None => full,
            Some(wanted) => {
                let mut filtered = serde_json::Map::new();
                if let serde_json::Value::Object(map) = full {
                    for (key, value) in map {
                        if wanted.contains(&key.as_str()) {
                            filtered.insert(key, value);
                        }
                    }
                }
                serde_json::Value::Object(filtered)
            }
        }
    }

    async fn snapshot(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        json!({
            "uptime_secs": self.started.elapsed().as_secs(),
            "requests": {
                "total": inner.requests_total,
                "success": inner.requests_success,
                "error": inner.requests_error,
                "response_time_ms": {
                    "samples": inner.response_times_ms.len(),
                    "p50": percentile(&inner.response_times_ms, 0.50),
                    "p95": percentile(&inner.response_times_ms, 0.95),
                    "p99": percentile(&inner.response_times_ms, 0.99),
                },
            },
            "errors": {
                "by_type": inner.errors_by_type.clone(),
                "by_endpoint": inner.errors_by_endpoint.clone(),
                "recent": inner.recent_errors.clone(),
            },
            "browser_pool": inner.pool.clone(),
            "tab_pool": inner.tabs.clone(),
            "result_cache": inner.result_cache.clone(),
            "content_cache": inner.content_cache.clone(),
            "throttle": inner.throttle.clone(),
            "retry": inner.retry.clone(),
        })
    }

    /// Points for one series, optionally bounded by a time range.
    pub async fn get_time_series(
        &self,
        metric_type: &str,
        name: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<(DateTime<Utc>, f64)> {
        let inner = self.inner.lock().await;
        inner
            .time_series
            .get(&(metric_type.to_string(), name.to_string()))
            .map(|series| {
                series
                    .iter()
                    .filter(|(ts, _)| {
                        start.map(|s| *ts >= s).unwrap_or(true)
                            && end.map(|e| *ts <= e).unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Write the final snapshot to the log; the last step of shutdown.
    pub async fn flush(&self) {
        let snapshot = self.get_metrics().await;
        tracing::info!(metrics = %snapshot, "final metrics snapshot");
    }
}

/// Percentile over the sliding window; 0.0 when empty.
fn percentile(samples: &VecDeque<f64>, q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((sorted.len() as f64 * q).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[index]
}

/// Fraction of system memory held by this process, via procfs.
fn memory_usage_fraction() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;

    let rss_kb = parse_kb_line(&status, "VmRSS:")?;
    let total_kb = parse_kb_line(&meminfo, "MemTotal:")?;
    if total_kb == 0 {
        return None;
    }
    Some(rss_kb as f64 / total_kb as f64)
}

fn parse_kb_line(content: &str, prefix: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(prefix))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn percentile_reads_sorted_window() {
        let samples: VecDeque<f64> = (1..=100).map(|n| n as f64).collect();
        assert_eq!(percentile(&samples, 0.50), 50.0);
        assert_eq!(percentile(&samples, 0.95), 95.0);
        assert_eq!(percentile(&samples, 0.99), 99.0);
        assert_eq!(percentile(&VecDeque::new(), 0.95), 0.0);
    }

    #[tokio::test]
    async fn counters_and_percentiles_aggregate() {
        let collector = MetricsCollector::new();
        for i in 0..10 {
            collector.record_request("capture", 200, 100.0 + i as f64).await;
        }
        collector.record_request("capture", 503, 9000.0).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics["requests"]["total"], 11);
        assert_eq!(metrics["requests"]["success"], 10);
        assert_eq!(metrics["requests"]["error"], 1);
        assert!(metrics["requests"]["response_time_ms"]["p99"].as_f64().unwrap() >= 9000.0);
    }

    #[tokio::test]
    async fn error_ring_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..150 {
            collector
                .record_error("navigation_error", "capture", &format!("err {i}"))
                .await;
        }
        let metrics = collector.get_metrics().await;
        let recent = metrics["errors"]["recent"].as_array().unwrap();
        assert_eq!(recent.len(), MAX_RECENT_ERRORS);
        // Oldest entries were dropped
        assert_eq!(recent[0]["details"], "err 50");
        assert_eq!(metrics["errors"]["by_type"]["navigation_error"], 150);
    }

    #[tokio::test]
    async fn section_filter_limits_snapshot() {
        let collector = MetricsCollector::new();
        collector.record_request("capture", 200, 10.0).await;

        let filtered = collector.get_metrics_sections(Some(&["requests"])).await;
        assert!(filtered.get("requests").is_some());
        assert!(filtered.get("errors").is_none());
        assert!(filtered.get("browser_pool").is_none());
    }

    #[tokio::test]
    async fn time_series_filters_by_range() {
        let collector = MetricsCollector::new();
        collector.record_time_series("pool", "utilization", 0.5).await;
        collector.record_time_series("pool", "utilization", 0.7).await;

        let all = collector
            .get_time_series("pool", "utilization", None, None)
            .await;
        assert_eq!(all.len(), 2);

        let future = Utc::now() + chrono::Duration::hours(1);
        let none = collector
            .get_time_series("pool", "utilization", Some(future), None)
            .await;
        assert!(none.is_empty());

        let missing = collector.get_time_series("pool", "nope", None, None).await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn pool_usage_alert_fires_once_per_cooldown() {
        let collector = MetricsCollector::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        collector.register_alert_handler(Box::new(move |alert| {
            if alert.kind == AlertKind::PoolUsage {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let hot = BrowserPoolStats {
            total_slots: 10,
            available: 0,
            in_use: 10,
            min_size: 2,
            max_size: 10,
            utilization: 1.0,
            created: 10,
            reused: 0,
            recycled: 0,
            errors: 0,
            peak_usage: 10,
        };
        collector.update_pool_stats(hot.clone()).await;
        collector.update_pool_stats(hot).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1, "cooldown suppresses repeat");
    }
}
