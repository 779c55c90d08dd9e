//! Periodic self-probe against the service's own capture endpoint
//!
//! The probe requests a capture with cache bypass so the whole pipeline
//! (pool, navigation, capture, storage) is exercised, not just process
//! liveness. Rolling success counts feed the health surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::SharedSettings;

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStats {
    pub probes: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub success_rate: f64,
}

pub struct HealthChecker {
    settings: SharedSettings,
    http: reqwest::Client,
    probes: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl HealthChecker {
    pub fn new(settings: SharedSettings) -> Arc<Self> {
        let timeout = settings.snapshot().health.timeout;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            settings,
            http,
            probes: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        })
    }

    /// Spawn the probe loop; waits out the startup delay before the first
    /// probe so the pool has time to warm up.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move {
            let health = checker.settings.snapshot().health;
            if !health.enabled {
                return;
            }
            sleep(health.startup_delay).await;
            info!(url = %health.probe_url, interval = ?health.interval, "health checker started");
            loop {
                checker.probe().await;
                sleep(checker.settings.snapshot().health.interval).await;
            }
        })
    }

    /// One probe round-trip.
    pub async fn probe(&self) -> bool {
        let url = self.settings.snapshot().health.probe_url;
        self.probes.fetch_add(1, Ordering::Relaxed);

        let ok = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "health probe returned failure status");
                false
            }
            Err(e) => {
                warn!(error = %e, "health probe request failed");
                false
            }
        };

        if ok {
            self.successes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn stats(&self) -> HealthStats {
        let probes = self.probes.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        HealthStats {
            probes,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            success_rate: if probes > 0 {
                successes as f64 / probes as f64
            } else {
                1.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[tokio::test]
    async fn failed_probe_updates_rolling_counts() {
        let mut s = Settings::default();
        // Nothing listens here; the probe must fail fast
        s.health.probe_url = "http://127.0.0.1:1/health".to_string();
        s.health.timeout = std::time::Duration::from_millis(500);
        let checker = HealthChecker::new(SharedSettings::new(s));

        assert!(!checker.probe().await);
        assert!(!checker.probe().await);

        let stats = checker.stats();
        assert_eq!(stats.probes, 2);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.consecutive_failures, 2);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn stats_default_to_healthy_before_first_probe() {
        let checker = HealthChecker::new(SharedSettings::new(Settings::default()));
        assert_eq!(checker.stats().success_rate, 1.0);
    }
}
