//! Bounded work queue with a concurrency cap and priority retries.
//!
//! Draining is edge-triggered: a completed task or a fresh enqueue pops
//! pending tasks until the queue is empty or the in-flight cap is hit.
//! Failed tasks re-enter at the front of the queue after a linear backoff,
//! so retries run before newly arrived work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::BotError;
use crate::event::Event;

/// Maximum runs of a single task, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// A unit of work: one inbound event and where it came from.
#[derive(Debug, Clone)]
pub struct QueueTask {
    pub event: Event,
    pub relay: String,
    pub attempts: u32,
}

impl QueueTask {
    pub fn new(event: Event, relay: impl Into<String>) -> Self {
        Self {
            event,
            relay: relay.into(),
            attempts: 0,
        }
    }

    /// Whether this run is the task's last chance.
    pub fn final_attempt(&self) -> bool {
        self.attempts + 1 >= MAX_ATTEMPTS
    }
}

/// Task body executed by the queue.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &QueueTask) -> Result<(), BotError>;
}

/// Tunables for the queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// Base of the linear retry backoff (`retry_delay × attempts`).
    pub retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 10_000,
            attempt_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Counters exposed on the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub avg_process_ms: f64,
}

struct Inner {
    queue: VecDeque<QueueTask>,
    in_flight: usize,
    accepting: bool,
    processed: u64,
    failed: u64,
    retried: u64,
    dropped: u64,
    avg_process_ms: f64,
}

struct Shared {
    cfg: QueueConfig,
    handler: Arc<dyn TaskHandler>,
    inner: Mutex<Inner>,
    drained: Notify,
}

/// Bounded FIFO with an in-flight cap. Cheap to clone; all clones share
/// the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    pub fn new(cfg: QueueConfig, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                handler,
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    in_flight: 0,
                    accepting: true,
                    processed: 0,
                    failed: 0,
                    retried: 0,
                    dropped: 0,
                    avg_process_ms: 0.0,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Enqueue a task. Returns `false` when the queue is full or shutting
    /// down; the caller decides whether the sender gets a notice.
    pub fn enqueue(&self, task: QueueTask) -> bool {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.accepting || inner.queue.len() >= self.shared.cfg.max_queue_size {
                inner.dropped += 1;
                return false;
            }
            inner.queue.push_back(task);
        }
        self.maybe_drain();
        true
    }

    /// Pop and start tasks until the queue is empty or concurrency is
    /// saturated.
    fn maybe_drain(&self) {
        loop {
            let task = {
                let mut inner = self.shared.inner.lock();
                if inner.in_flight >= self.shared.cfg.max_concurrent {
                    return;
                }
                match inner.queue.pop_front() {
                    Some(task) => {
                        inner.in_flight += 1;
                        task
                    }
                    None => return,
                }
            };
            let queue = self.clone();
            tokio::spawn(async move { queue.run_task(task).await });
        }
    }

    async fn run_task(self, mut task: QueueTask) {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.shared.cfg.attempt_timeout,
            self.shared.handler.handle(&task),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(BotError::Transient(format!(
                "task exceeded {}s deadline",
                self.shared.cfg.attempt_timeout.as_secs()
            ))),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => {
                let mut inner = self.shared.inner.lock();
                inner.processed += 1;
                inner.avg_process_ms = if inner.processed == 1 {
                    elapsed_ms
                } else {
                    inner.avg_process_ms * 0.9 + elapsed_ms * 0.1
                };
                self.finish_one(&mut inner);
            }
            Err(err) => {
                task.attempts += 1;
                if task.attempts < MAX_ATTEMPTS && err.is_retryable() {
                    let backoff = self.shared.cfg.retry_delay * task.attempts;
                    debug!(
                        event = %task.event.id,
                        attempts = task.attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        %err,
                        "task failed, scheduling retry"
                    );
                    {
                        let mut inner = self.shared.inner.lock();
                        inner.retried += 1;
                        self.finish_one(&mut inner);
                    }
                    let queue = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        queue.shared.inner.lock().queue.push_front(task);
                        queue.maybe_drain();
                    });
                    return;
                }
                warn!(event = %task.event.id, %err, "task failed after retries");
                let mut inner = self.shared.inner.lock();
                inner.failed += 1;
                self.finish_one(&mut inner);
            }
        }
        self.maybe_drain();
    }

    fn finish_one(&self, inner: &mut Inner) {
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            self.shared.drained.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.shared.inner.lock();
        QueueStats {
            pending: inner.queue.len(),
            in_flight: inner.in_flight,
            processed: inner.processed,
            failed: inner.failed,
            retried: inner.retried,
            dropped: inner.dropped,
            avg_process_ms: inner.avg_process_ms,
        }
    }

    /// Stop accepting work, then wait until nothing is in flight.
    pub async fn shutdown(&self) {
        self.shared.inner.lock().accepting = false;
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            // register before the check so a completion in between is not lost
            notified.as_mut().enable();
            if self.shared.inner.lock().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{kind, Tag};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn task(id: &str) -> QueueTask {
        QueueTask::new(
            Event {
                id: id.into(),
                pubkey: "p".into(),
                kind: kind::PRIVATE_MESSAGE,
                created_at: 1,
                tags: vec![Tag::new(["p", "bot"])],
                content: String::new(),
                sig: String::new(),
            },
            "wss://relay",
        )
    }

    struct CountingHandler {
        calls: AtomicU64,
        fail_first: u64,
        delay: Duration,
    }

    impl CountingHandler {
        fn new(fail_first: u64, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                fail_first,
                delay,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _task: &QueueTask) -> Result<(), BotError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.fail_first {
                Err(BotError::Transient("induced".into()))
            } else {
                Ok(())
            }
        }
    }

    fn config(max_concurrent: usize, max_queue: usize) -> QueueConfig {
        QueueConfig {
            max_concurrent,
            max_queue_size: max_queue,
            attempt_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn processes_enqueued_tasks() {
        let handler = CountingHandler::new(0, Duration::ZERO);
        let queue = WorkQueue::new(config(2, 10), handler.clone());
        for i in 0..5 {
            assert!(queue.enqueue(task(&format!("e{i}"))));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = queue.stats();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 0);
        assert!(stats.avg_process_ms >= 0.0);
    }

    #[tokio::test]
    async fn rejects_when_full() {
        // a slow handler keeps the single slot busy while the queue fills
        let handler = CountingHandler::new(0, Duration::from_millis(200));
        let queue = WorkQueue::new(config(1, 2), handler);
        assert!(queue.enqueue(task("e0"))); // starts immediately
        assert!(queue.enqueue(task("e1")));
        assert!(queue.enqueue(task("e2")));
        assert!(!queue.enqueue(task("e3")));
        assert_eq!(queue.stats().dropped, 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let handler = CountingHandler::new(2, Duration::ZERO);
        let queue = WorkQueue::new(config(1, 10), handler.clone());
        assert!(queue.enqueue(task("e0")));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = queue.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_failed() {
        let handler = CountingHandler::new(100, Duration::ZERO);
        let queue = WorkQueue::new(config(1, 10), handler.clone());
        assert!(queue.enqueue(task("e0")));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn respects_concurrency_cap() {
        let handler = CountingHandler::new(0, Duration::from_millis(100));
        let queue = WorkQueue::new(config(2, 10), handler);
        for i in 0..4 {
            queue.enqueue(task(&format!("e{i}")));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.stats().in_flight, 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.stats().processed, 4);
    }

    #[tokio::test]
    async fn attempt_timeout_fails_slow_tasks() {
        let handler = CountingHandler::new(0, Duration::from_secs(10));
        let queue = WorkQueue::new(
            QueueConfig {
                max_concurrent: 1,
                max_queue_size: 10,
                attempt_timeout: Duration::from_millis(30),
                retry_delay: Duration::from_millis(5),
            },
            handler,
        );
        queue.enqueue(task("e0"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        struct MalformedHandler(AtomicU64);

        #[async_trait]
        impl TaskHandler for MalformedHandler {
            async fn handle(&self, _task: &QueueTask) -> Result<(), BotError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(BotError::Rejected("policy".into()))
            }
        }

        let handler = Arc::new(MalformedHandler(AtomicU64::new(0)));
        let queue = WorkQueue::new(config(1, 10), handler.clone());
        queue.enqueue(task("e0"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 0);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight() {
        let handler = CountingHandler::new(0, Duration::from_millis(50));
        let queue = WorkQueue::new(config(2, 10), handler);
        queue.enqueue(task("e0"));
        queue.enqueue(task("e1"));
        queue.shutdown().await;
        let stats = queue.stats();
        assert_eq!(stats.in_flight, 0);
        assert!(!queue.enqueue(task("e2")));
    }
}
