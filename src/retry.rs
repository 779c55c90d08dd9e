//! Retry engine with exponential backoff and circuit breaking
//!
//! `RetryManager` wraps browser operations in classified, jittered retries.
//! Each manager can be paired with a `CircuitBreaker`; breakers are shared
//! per target domain through `CircuitBreakerRegistry` so one failing site
//! cannot poison captures of healthy ones.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{CircuitBreakerSettings, RetrySettings};
use crate::error::{classify, ErrorClass, ScreenshotError};

/// Retry attempts allowed for errors the classifier cannot place.
const UNKNOWN_ERROR_RETRY_BUDGET: usize = 3;

/// Fraction of requests admitted while a breaker is half-open.
const HALF_OPEN_ADMISSION: f64 = 0.3;

/// Immutable retry tuning.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction (0–1) applied to each computed delay
    pub jitter: f64,
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: s.base_delay,
            max_delay: s.max_delay,
            jitter: s.jitter,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        (&RetrySettings::default()).into()
    }
}

impl RetryConfig {
    /// Delay before retry `retry_count` (0-based), without jitter.
    ///
    /// Exponential backoff clamped to `max_delay`, scaled by an adaptive
    /// factor derived from the failing error's text, clamped again.
    pub fn delay_without_jitter(&self, retry_count: usize, error_kind: &str) -> Duration {
        let exp = (self.base_delay.as_secs_f64() * 2f64.powi(retry_count as i32))
            .min(self.max_delay.as_secs_f64());

        let factor = if error_kind.contains("timeout") {
            1.5
        } else if error_kind.contains("memory") || error_kind.contains("resource") {
            2.0
        } else if error_kind.contains("connection") || error_kind.contains("network") {
            1.2
        } else {
            1.0
        };

        Duration::from_secs_f64((exp * factor).min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay before retry `retry_count`.
    pub fn delay(&self, retry_count: usize, error_kind: &str) -> Duration {
        let base = self.delay_without_jitter(retry_count, error_kind).as_secs_f64();
        let jitter_amount = base * self.jitter;
        let offset = (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * jitter_amount;
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BreakerStats {
    pub trips: u64,
    pub resets: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: usize,
    last_failure: Option<Instant>,
    stats: BreakerStats,
}

/// Per-domain circuit breaker with progressive recovery.
///
/// While open, admission ramps up probabilistically over the second half
/// of the reset window instead of flipping all-or-nothing; half-open
/// state admits a fixed fraction of probes until one succeeds.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: usize,
    reset_time: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: usize, reset_time: Duration) -> Self {
        Self {
            name: name.into(),
            threshold,
            reset_time,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                stats: BreakerStats::default(),
            }),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self::new(name, settings.threshold, settings.reset_time)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission probability during progressive recovery.
    ///
    /// Zero before half the reset window has elapsed, then climbs linearly
    /// to 1.0 at the full window.
    pub fn recovery_probability(&self, elapsed: Duration) -> f64 {
        let reset = self.reset_time.as_secs_f64();
        let elapsed = elapsed.as_secs_f64();
        if elapsed >= reset {
            1.0
        } else if elapsed >= reset * 0.5 {
            (elapsed - reset * 0.5) / (reset * 0.5)
        } else {
            0.0
        }
    }

    pub async fn can_execute(&self) -> bool {
        let roll = rand::thread_rng().gen::<f64>();
        self.evaluate(roll).await
    }

    /// Admission decision with an injected probability roll (tests pass a
    /// fixed roll; `can_execute` passes a uniform sample).
    pub async fn evaluate(&self, roll: f64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_time {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "circuit breaker transitioning open -> half-open");
                    true
                } else {
                    let admit = roll < self.recovery_probability(elapsed);
                    if admit {
                        debug!(
                            breaker = %self.name,
                            elapsed = ?elapsed,
                            "admitting request during progressive recovery"
                        );
                    }
                    admit
                }
            }
            CircuitState::HalfOpen => roll < HALF_OPEN_ADMISSION,
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.stats.resets += 1;
            info!(breaker = %self.name, "circuit breaker reset half-open -> closed");
        }
        inner.failure_count = 0;
        inner.stats.successes += 1;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.failures += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.failure_count = 1;
            inner.last_failure = Some(Instant::now());
            warn!(breaker = %self.name, "half-open probe failed, circuit breaker re-opened");
            return;
        }

        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.state == CircuitState::Closed && inner.failure_count >= self.threshold {
            inner.state = CircuitState::Open;
            inner.stats.trips += 1;
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                threshold = self.threshold,
                "circuit breaker tripped closed -> open"
            );
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> usize {
        self.inner.lock().await.failure_count
    }

    pub async fn stats(&self) -> BreakerStats {
        self.inner.lock().await.stats.clone()
    }

    /// Time until the breaker would leave the open state on its own.
    pub async fn remaining_reset(&self) -> Duration {
        let inner = self.inner.lock().await;
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(t)) => self.reset_time.saturating_sub(t.elapsed()),
            _ => Duration::ZERO,
        }
    }
}

/// Shared per-domain breakers.
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    pub fn for_domain(&self, domain: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(domain.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::from_settings(domain, &self.settings))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RetryStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub retries: AtomicU64,
    pub circuit_breaker_rejections: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RetryStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub circuit_breaker_rejections: u64,
}

/// Executes operations with retries, adaptive delays and circuit breaking.
pub struct RetryManager {
    name: String,
    config: RetryConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    /// Applied to every individual attempt when set
    attempt_timeout: Option<Duration>,
    stats: RetryStats,
}

impl RetryManager {
    pub fn new(
        name: impl Into<String>,
        config: RetryConfig,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            breaker,
            attempt_timeout: None,
            stats: RetryStats::default(),
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Run `op`, retrying per the error classification rules.
    ///
    /// Navigation-class operations fail fast with `CircuitOpen` while the
    /// breaker rejects; other operations proceed with their retry budget
    /// capped at one. Permanent errors surface unchanged so callers keep
    /// the original error kind.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        mut op: F,
    ) -> Result<T, ScreenshotError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScreenshotError>>,
    {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let is_navigation = operation_name.to_lowercase().contains("navigate");
        let mut effective_max = self.config.max_retries;
        let mut retry_count = 0usize;
        let last_error;

        loop {
            if let Some(breaker) = &self.breaker {
                if !breaker.can_execute().await {
                    self.stats
                        .circuit_breaker_rejections
                        .fetch_add(1, Ordering::Relaxed);

                    if is_navigation {
                        warn!(
                            manager = %self.name,
                            operation = operation_name,
                            "circuit breaker open, failing navigation fast"
                        );
                        return Err(ScreenshotError::CircuitOpen {
                            name: breaker.name().to_string(),
                            retry_after: breaker.remaining_reset().await,
                        });
                    }
                    // Non-navigation work still runs, with the budget cut
                    effective_max = effective_max.min(1);
                }
            }

            if retry_count > 0 {
                info!(
                    manager = %self.name,
                    operation = operation_name,
                    attempt = retry_count + 1,
                    max_attempts = effective_max + 1,
                    "retrying operation"
                );
            }

            let attempt = async {
                match self.attempt_timeout {
                    Some(limit) => match timeout(limit, op()).await {
                        Ok(result) => result,
                        Err(_) => Err(ScreenshotError::Timeout(limit)),
                    },
                    None => op().await,
                }
            };

            match attempt.await {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success().await;
                    }
                    self.stats.successes.fetch_add(1, Ordering::Relaxed);
                    if retry_count > 0 {
                        info!(
                            manager = %self.name,
                            operation = operation_name,
                            retries = retry_count,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure().await;
                    }

                    let retryable = match classify(&err) {
                        ErrorClass::Permanent => false,
                        ErrorClass::Transient => true,
                        ErrorClass::Unknown => retry_count < UNKNOWN_ERROR_RETRY_BUDGET,
                    };

                    if !retryable {
                        debug!(
                            manager = %self.name,
                            operation = operation_name,
                            error = %err,
                            "error not retryable, surfacing original kind"
                        );
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }

                    if retry_count >= effective_max {
                        last_error = err;
                        break;
                    }

                    let kind = err.to_string().to_lowercase();
                    let delay = self.config.delay(retry_count, &kind);
                    warn!(
                        manager = %self.name,
                        operation = operation_name,
                        attempt = retry_count + 1,
                        delay = ?delay,
                        error = %err,
                        "attempt failed, backing off"
                    );

                    retry_count += 1;
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    sleep(delay).await;
                }
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        Err(ScreenshotError::RetriesExhausted {
            operation: operation_name.to_string(),
            retries: retry_count,
            cause: last_error.to_string(),
        })
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            successes: self.stats.successes.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            circuit_breaker_rejections: self
                .stats
                .circuit_breaker_rejections
                .load(Ordering::Relaxed),
        }
    }
}
