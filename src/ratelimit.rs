//! Two-tier token bucket rate limiter.
//!
//! One global bucket gates total throughput; per-principal buckets gate
//! individual senders. Refill is lazy, computed from elapsed wall-clock at
//! check time. Idle per-user buckets are swept by a background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Idle duration after which a per-user bucket is dropped.
const BUCKET_IDLE_EXPIRY: Duration = Duration::from_secs(3600);

/// Cadence of the idle-bucket sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tokens consumed per request.
const COST: f64 = 1.0;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    Limited {
        /// Seconds until enough tokens will have refilled.
        retry_after_secs: u64,
        /// Whether the global bucket denied before the user bucket.
        global: bool,
    },
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(capacity);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, capacity: f64, rate: f64, now: Instant) -> Result<(), u64> {
        self.refill(capacity, rate, now);
        if self.tokens >= COST {
            self.tokens -= COST;
            Ok(())
        } else {
            let deficit = COST - self.tokens;
            let wait = (deficit / rate).ceil() as u64;
            Err(wait.max(1))
        }
    }
}

/// Snapshot of limiter state for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub tracked_users: usize,
    pub global_tokens: f64,
}

/// Global plus per-principal token buckets.
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    global: Mutex<Bucket>,
    users: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self {
            capacity,
            rate,
            global: Mutex::new(Bucket::full(capacity)),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Check and consume one token for `pubkey`. The global bucket is
    /// consulted first so its denial takes precedence.
    pub fn check(&self, pubkey: &str) -> RateDecision {
        let now = Instant::now();
        if let Err(retry) = self
            .global
            .lock()
            .try_take(self.capacity, self.rate, now)
        {
            return RateDecision::Limited {
                retry_after_secs: retry,
                global: true,
            };
        }
        let mut users = self.users.lock();
        let capacity = self.capacity;
        let bucket = users
            .entry(pubkey.to_string())
            .or_insert_with(|| Bucket::full(capacity));
        match bucket.try_take(self.capacity, self.rate, now) {
            Ok(()) => RateDecision::Allowed,
            Err(retry) => RateDecision::Limited {
                retry_after_secs: retry,
                global: false,
            },
        }
    }

    /// Drop per-user buckets idle for over an hour.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut users = self.users.lock();
        let before = users.len();
        users.retain(|_, b| now.duration_since(b.last_refill) < BUCKET_IDLE_EXPIRY);
        before - users.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut global = self.global.lock();
        global.refill(self.capacity, self.rate, Instant::now());
        RateLimiterStats {
            tracked_users: self.users.lock().len(),
            global_tokens: global.tokens,
        }
    }

    /// Spawn the once-per-minute idle sweep, stopping on shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        let removed = limiter.sweep_idle();
                        if removed > 0 {
                            debug!(removed, "swept idle rate-limit buckets");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity() {
        let limiter = RateLimiter::new(3.0, 1.0);
        for _ in 0..3 {
            assert_eq!(limiter.check("p1"), RateDecision::Allowed);
        }
        assert!(matches!(
            limiter.check("p1"),
            RateDecision::Limited { global: false, .. }
        ));
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(1.0, 5.0);
        assert_eq!(limiter.check("p1"), RateDecision::Allowed);
        match limiter.check("p1") {
            RateDecision::Limited {
                retry_after_secs, ..
            } => assert!(retry_after_secs >= 1),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn principals_are_independent() {
        let limiter = RateLimiter::new(2.0, 0.001);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert!(matches!(limiter.check("a"), RateDecision::Limited { .. }));
        assert_eq!(limiter.check("b"), RateDecision::Allowed);
    }

    #[test]
    fn global_denial_reported_first() {
        // global capacity exhausted by two distinct users
        let limiter = RateLimiter::new(2.0, 0.001);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("b"), RateDecision::Allowed);
        assert!(matches!(
            limiter.check("c"),
            RateDecision::Limited { global: true, .. }
        ));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(1.0, 100.0);
        assert_eq!(limiter.check("p1"), RateDecision::Allowed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(limiter.check("p1"), RateDecision::Allowed);
    }

    #[test]
    fn sweep_keeps_active_buckets() {
        let limiter = RateLimiter::new(5.0, 1.0);
        limiter.check("p1");
        assert_eq!(limiter.sweep_idle(), 0);
        assert_eq!(limiter.stats().tracked_users, 1);
    }
}
