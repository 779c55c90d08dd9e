//! Token-bucket rate limiting for batch admission
//!
//! One bucket per user; tiers set the refill rate and burst capacity.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

/// Longest a caller is parked waiting for refill before being rejected.
const MAX_WAIT: Duration = Duration::from_secs(5);

/// User tiers with their admission budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl UserTier {
    /// (tokens per period, period, burst capacity)
    pub fn limits(&self) -> (f64, Duration, f64) {
        match self {
            UserTier::Free => (10.0, Duration::from_secs(60), 20.0),
            UserTier::Basic => (30.0, Duration::from_secs(60), 50.0),
            UserTier::Premium => (60.0, Duration::from_secs(60), 100.0),
            UserTier::Enterprise => (120.0, Duration::from_secs(60), 200.0),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket: `rate` tokens per `per`, up to `burst` accumulated.
///
/// `acquire` parks the caller for short refill waits instead of failing,
/// which smooths bursts just over the budget.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    per: Duration,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(rate: f64, per: Duration, burst: f64) -> Self {
        Self {
            rate,
            per,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn for_tier(tier: UserTier) -> Self {
        let (rate, per, burst) = tier.limits();
        Self::new(rate, per, burst)
    }

    /// Take `tokens` from the bucket, waiting up to 5 s for refill.
    ///
    /// Returns false when the required wait would exceed the cap.
    pub async fn acquire(&self, tokens: f64) -> bool {
        let wait = {
            let mut state = self.state.lock().await;
            self.refill(&mut state);

            if state.tokens >= tokens {
                state.tokens -= tokens;
                return true;
            }

            let deficit = tokens - state.tokens;
            Duration::from_secs_f64(deficit * self.per.as_secs_f64() / self.rate)
        };

        if wait > MAX_WAIT {
            debug!(wait = ?wait, "rate limit wait exceeds cap, rejecting");
            return false;
        }

        sleep(wait).await;
        let mut state = self.state.lock().await;
        state.tokens = 0.0;
        state.last_update = Instant::now();
        true
    }

    /// Current token count after refill (diagnostic).
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update);
        state.last_update = now;
        let added = elapsed.as_secs_f64() * (self.rate / self.per.as_secs_f64());
        state.tokens = (state.tokens + added).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_spendable_immediately() {
        let limiter = RateLimiter::new(10.0, Duration::from_secs(60), 5.0);
        for _ in 0..5 {
            assert!(limiter.acquire(1.0).await);
        }
        assert!(limiter.available().await < 1.0);
    }

    #[tokio::test]
    async fn short_deficit_waits_then_succeeds() {
        // 100 tokens/s: a one-token deficit costs ~10ms of waiting
        let limiter = RateLimiter::new(100.0, Duration::from_secs(1), 1.0);
        assert!(limiter.acquire(1.0).await);

        let start = Instant::now();
        assert!(limiter.acquire(1.0).await);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn long_deficit_is_rejected() {
        // 1 token/minute: a 50-token deficit needs far more than 5s
        let limiter = RateLimiter::new(1.0, Duration::from_secs(60), 1.0);
        assert!(limiter.acquire(1.0).await);
        assert!(!limiter.acquire(50.0).await);
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(100.0, Duration::from_secs(1), 10.0);
        assert!(limiter.acquire(10.0).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let available = limiter.available().await;
        assert!(available > 1.0, "expected refill, got {available}");
        assert!(available <= 10.0);
    }

    #[test]
    fn tier_budgets_increase() {
        let (free, _, free_burst) = UserTier::Free.limits();
        let (ent, _, ent_burst) = UserTier::Enterprise.limits();
        assert!(ent > free);
        assert!(ent_burst > free_burst);
    }
}
