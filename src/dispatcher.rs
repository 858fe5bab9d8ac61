//! Event intake: classification, deduplication, and rate limiting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::accounting::Accounting;
use crate::event::kind;
use crate::processor::Outbox;
use crate::queue::{QueueTask, WorkQueue};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::relay::IncomingEvent;
use crate::signer::Signer;

/// Recent event ids remembered for replay suppression.
const SEEN_CAPACITY: usize = 1000;

/// How long a content fingerprint suppresses duplicates.
const FINGERPRINT_TTL: Duration = Duration::from_secs(300);

/// Cadence of the fingerprint sweep.
const FINGERPRINT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Expired fingerprints removed per sweep tick.
const FINGERPRINT_SWEEP_STEP: usize = 256;

/// Process-wide intake counters.
#[derive(Debug, Default)]
pub struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    rate_limited: AtomicU64,
    errors: AtomicU64,
}

/// Serializable view of [`Counters`].
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub sent: u64,
    pub queued: u64,
    pub dropped: u64,
    pub rate_limited: u64,
    pub errors: u64,
}

impl Counters {
    pub fn bump_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// FIFO-evicted ring of recently seen event ids.
struct SeenRing {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenRing {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` when the id is new.
    fn check_and_insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

/// TTL'd `principal:plaintext` fingerprints guarding against the same
/// message echoed by multiple relays under different event ids.
pub struct FingerprintCache {
    ttl: Duration,
    map: Mutex<HashMap<String, Instant>>,
}

impl FingerprintCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ttl: FINGERPRINT_TTL,
            map: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            map: Mutex::new(HashMap::new()),
        })
    }

    /// Returns `true` when this content has not been seen recently.
    pub fn check_and_insert(&self, pubkey: &str, text: &str) -> bool {
        let key = format!("{pubkey}:{text}");
        let now = Instant::now();
        let mut map = self.map.lock();
        match map.get(&key) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                map.insert(key, now);
                true
            }
        }
    }

    /// Remove up to `limit` expired entries.
    pub fn sweep(&self, limit: usize) -> usize {
        let now = Instant::now();
        let mut map = self.map.lock();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= self.ttl)
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            map.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic bounded sweep; the TTL is the contract, the cadence is an
    /// implementation detail.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(FINGERPRINT_SWEEP_INTERVAL) => {
                        let removed = cache.sweep(FINGERPRINT_SWEEP_STEP);
                        if removed > 0 {
                            debug!(removed, "swept expired content fingerprints");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

/// Routes delivered events: accounting branch, dedup, rate limiting, and
/// the work queue.
pub struct Dispatcher {
    signer: Arc<Signer>,
    seen: Mutex<SeenRing>,
    limiter: Arc<RateLimiter>,
    queue: WorkQueue,
    accounting: Arc<Accounting>,
    outbox: Arc<Outbox>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(
        signer: Arc<Signer>,
        limiter: Arc<RateLimiter>,
        queue: WorkQueue,
        accounting: Arc<Accounting>,
        outbox: Arc<Outbox>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            signer,
            seen: Mutex::new(SeenRing::new()),
            limiter,
            queue,
            accounting,
            outbox,
            counters,
        })
    }

    /// Consume the supervisor's delivery channel until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<IncomingEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                incoming = events.recv() => match incoming {
                    Some(incoming) => self.dispatch(incoming).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("dispatcher stopped");
    }

    pub async fn dispatch(&self, incoming: IncomingEvent) {
        let ev = incoming.event;
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if ev.pubkey == self.signer.public_key() {
            return;
        }
        if !self.seen.lock().check_and_insert(&ev.id) {
            debug!(event = %ev.id, "dropping replayed event id");
            return;
        }
        if let Err(err) = self.signer.verify(&ev) {
            debug!(event = %ev.id, %err, "dropping event with bad signature");
            return;
        }

        match ev.kind {
            kind::RECEIPT => self.accounting.handle_receipt(&ev).await,
            kind::BALANCE_QUERY => self.accounting.handle_balance_query(&ev).await,
            kind::PRIVATE_MESSAGE | kind::PUBLIC_POST => {
                let is_dm = ev.kind == kind::PRIVATE_MESSAGE;
                match self.limiter.check(&ev.pubkey) {
                    RateDecision::Limited {
                        retry_after_secs,
                        global,
                    } => {
                        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            author = %ev.pubkey,
                            retry_after_secs,
                            global,
                            "rate limited"
                        );
                        if is_dm {
                            let notice = format!(
                                "You're sending messages too quickly. Please retry \
                                 in {retry_after_secs}s."
                            );
                            if let Err(err) =
                                self.outbox.send_dm(&ev.pubkey, &notice, None).await
                            {
                                debug!(%err, "rate-limit notice failed");
                            }
                        }
                    }
                    RateDecision::Allowed => {
                        let author = ev.pubkey.clone();
                        if self.queue.enqueue(QueueTask::new(ev, incoming.relay)) {
                            self.counters.queued.fetch_add(1, Ordering::Relaxed);
                        } else {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(author = %author, "queue full, dropping event");
                            if is_dm {
                                let notice = "I'm overloaded right now. Please try \
                                              again in a little while.";
                                if let Err(err) =
                                    self.outbox.send_dm(&author, notice, None).await
                                {
                                    debug!(%err, "overload notice failed");
                                }
                            }
                        }
                    }
                }
            }
            other => {
                debug!(kind = other, "ignoring event of unhandled kind");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_ring_deduplicates() {
        let mut ring = SeenRing::new();
        assert!(ring.check_and_insert("a"));
        assert!(!ring.check_and_insert("a"));
        assert!(ring.check_and_insert("b"));
    }

    #[test]
    fn seen_ring_evicts_fifo() {
        let mut ring = SeenRing::new();
        for i in 0..SEEN_CAPACITY + 1 {
            assert!(ring.check_and_insert(&format!("e{i}")));
        }
        // the first id fell off the ring and is accepted again
        assert!(ring.check_and_insert("e0"));
        assert!(!ring.check_and_insert(&format!("e{}", SEEN_CAPACITY)));
    }

    #[test]
    fn fingerprints_expire_after_ttl() {
        let cache = FingerprintCache::with_ttl(Duration::from_millis(20));
        assert!(cache.check_and_insert("p1", "hello"));
        assert!(!cache.check_and_insert("p1", "hello"));
        assert!(cache.check_and_insert("p2", "hello"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.check_and_insert("p1", "hello"));
    }

    #[test]
    fn sweep_is_bounded() {
        let cache = FingerprintCache::with_ttl(Duration::from_millis(1));
        for i in 0..10 {
            cache.check_and_insert("p", &format!("m{i}"));
        }
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep(4), 4);
        assert_eq!(cache.len(), 6);
        assert_eq!(cache.sweep(100), 6);
        assert!(cache.is_empty());
    }

    #[test]
    fn counters_snapshot() {
        let counters = Counters::default();
        counters.bump_sent();
        counters.bump_errors();
        counters.received.fetch_add(3, Ordering::Relaxed);
        let snap = counters.snapshot();
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.received, 3);
        assert_eq!(snap.dropped, 0);
    }
}
