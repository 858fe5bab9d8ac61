//! Circuit breaker guarding the AI backend.
//!
//! CLOSED counts consecutive failures and trips to OPEN at the threshold.
//! OPEN rejects calls until the reset timeout elapses; the first call after
//! that runs as a HALF_OPEN trial. A trial success closes the circuit, a
//! trial failure re-opens it and restarts the timer. Every call carries its
//! own deadline; a timeout counts as a failure.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::BotError;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for the breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before allowing a trial.
    pub reset_timeout: Duration,
    /// Deadline applied to every guarded call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        }
    }
}

struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    next_attempt: Instant,
}

/// Three-state failure gate around a single downstream.
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                next_attempt: Instant::now(),
            }),
        }
    }

    /// Run `fut` under the breaker and the per-call deadline. When the
    /// circuit is open the future is never polled and the call fails
    /// immediately with [`BotError::Overloaded`].
    pub async fn call<T, F>(&self, fut: F) -> Result<T, BotError>
    where
        F: Future<Output = Result<T, BotError>>,
    {
        self.try_acquire()?;
        match tokio::time::timeout(self.cfg.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(err)
            }
            Err(_) => {
                self.record_failure();
                Err(BotError::Transient(format!(
                    "call exceeded {}s deadline",
                    self.cfg.call_timeout.as_secs()
                )))
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    fn try_acquire(&self) -> Result<(), BotError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                if Instant::now() >= inner.next_attempt {
                    inner.state = BreakerState::HalfOpen;
                    inner.successes = 0;
                    Ok(())
                } else {
                    Err(BotError::Overloaded("circuit open".into()))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.cfg.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            _ => {
                inner.failures = 0;
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.next_attempt = Instant::now() + self.cfg.reset_timeout;
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.cfg.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.next_attempt = Instant::now() + self.cfg.reset_timeout;
                }
            }
            BreakerState::Open => {}
        }
    }
}
