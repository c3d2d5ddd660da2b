//! Fixed-window admission control keyed by identity.
//!
//! One limiter instance exists per budget (connection establishment, inbound
//! events). A bucket's counter is bumped only when an operation is admitted;
//! it is never rolled back, even if the admitted operation later fails.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Budget of `budget` cost units per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub budget: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(budget: u32, window: Duration) -> Self {
        Self { budget, window }
    }
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            buckets: DashMap::new(),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Admit `cost` units for `key`.
    ///
    /// Returns `Err(retry_after)` when the current window has no room left.
    /// `retry_after` is always non-zero.
    pub fn check(&self, key: &str, cost: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            window_start: now,
            count: 0,
        });

        if now.duration_since(bucket.window_start) >= self.policy.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count.saturating_add(cost) > self.policy.budget {
            let elapsed = now.duration_since(bucket.window_start);
            let retry_after = self
                .policy
                .window
                .saturating_sub(elapsed)
                .max(Duration::from_millis(1));
            return Err(retry_after);
        }

        bucket.count += cost;
        Ok(())
    }

    /// Drop buckets whose window has fully elapsed.
    pub fn retain_recent(&self) -> usize {
        let now = Instant::now();
        let window = self.policy.window;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.window_start) < window);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(budget: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitPolicy::new(budget, Duration::from_secs(window_secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_the_operation_past_budget() {
        let rl = limiter(3, 10);
        for _ in 0..3 {
            assert!(rl.check("usr_1", 1).is_ok());
        }
        let retry = rl.check("usr_1", 1).unwrap_err();
        assert!(retry > Duration::ZERO);
        assert!(retry <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_resets_after_window() {
        let rl = limiter(2, 10);
        rl.check("usr_1", 2).unwrap();
        assert!(rl.check("usr_1", 1).is_err());

        tokio::time::advance(Duration::from_secs(4)).await;
        let retry = rl.check("usr_1", 1).unwrap_err();
        assert_eq!(retry, Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(rl.check("usr_1", 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_checks_do_not_consume_budget() {
        let rl = limiter(3, 10);
        rl.check("usr_1", 2).unwrap();
        assert!(rl.check("usr_1", 2).is_err());
        // The rejected cost-2 check left room for one more unit.
        assert!(rl.check("usr_1", 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let rl = limiter(1, 10);
        rl.check("usr_1", 1).unwrap();
        assert!(rl.check("usr_1", 1).is_err());
        assert!(rl.check("usr_2", 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn retain_recent_prunes_stale_buckets() {
        let rl = limiter(5, 10);
        rl.check("usr_1", 1).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        rl.check("usr_2", 1).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(rl.retain_recent(), 1);
        assert_eq!(rl.len(), 1);
    }
}
