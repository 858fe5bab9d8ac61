//! Multi-relay subscription supervisor and publish fan-out.
//!
//! One long-running loop per relay: connect, subscribe with the startup
//! filters, stream frames, and hand every event off to the dispatcher
//! without blocking the read loop. Connection loss triggers exponential
//! backoff reconnection; after too many consecutive failures the relay is
//! marked permanently failed. The publish side fans out to all live relays
//! in parallel, each with its own deadline, and correlates relay OK frames
//! back to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::event::{kind, unix_now, unix_now_ms, Event};

/// Base reconnect backoff.
const RECONNECT_BASE_SECS: u64 = 5;

/// Reconnect backoff cap.
const RECONNECT_CAP_SECS: u64 = 60;

/// Consecutive failed reconnects before a relay is abandoned.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Per-relay connection health.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayHealth {
    pub connected: bool,
    /// Milliseconds since the epoch of the last delivered event.
    pub last_seen: Option<u64>,
    pub received: u64,
    pub sent: u64,
    pub failed_attempts: u32,
    pub permanently_failed: bool,
    pub publish_errors: u64,
    pub last_error: Option<String>,
}

/// An event delivered by a relay, tagged with its origin.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub event: Event,
    pub relay: String,
}

/// Result of one per-relay publish attempt.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub url: String,
    pub ok: bool,
    pub error: Option<String>,
}

struct PublishJob {
    payload: String,
    event_id: String,
    ack: oneshot::Sender<std::result::Result<(), String>>,
}

/// Supervisor over all configured relay connections.
pub struct RelaySupervisor {
    urls: Vec<String>,
    bot_pubkey: String,
    publish_timeout: Duration,
    health: Mutex<HashMap<String, RelayHealth>>,
    outboxes: Mutex<HashMap<String, mpsc::UnboundedSender<PublishJob>>>,
    events_tx: mpsc::UnboundedSender<IncomingEvent>,
    shutdown: watch::Receiver<bool>,
}

impl RelaySupervisor {
    pub fn new(
        urls: Vec<String>,
        bot_pubkey: String,
        publish_timeout: Duration,
        events_tx: mpsc::UnboundedSender<IncomingEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let health = urls
            .iter()
            .map(|u| (u.clone(), RelayHealth::default()))
            .collect();
        Arc::new(Self {
            urls,
            bot_pubkey,
            publish_timeout,
            health: Mutex::new(health),
            outboxes: Mutex::new(HashMap::new()),
            events_tx,
            shutdown,
        })
    }

    /// Spawn one subscription loop per configured relay.
    pub fn start(self: Arc<Self>) {
        for url in self.urls.clone() {
            let supervisor = Arc::clone(&self);
            tokio::spawn(async move { supervisor.relay_loop(url).await });
        }
    }

    async fn relay_loop(self: Arc<Self>, url: String) {
        let mut attempts: u32 = 0;
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_connection(&url, &mut attempts).await {
                Ok(()) => break, // clean shutdown
                Err(err) => {
                    attempts += 1;
                    self.with_health(&url, |h| {
                        h.connected = false;
                        h.failed_attempts = attempts;
                        h.last_error = Some(err.to_string());
                    });
                    if attempts >= MAX_CONSECUTIVE_FAILURES {
                        warn!(relay = %url, attempts, "relay permanently failed");
                        self.with_health(&url, |h| h.permanently_failed = true);
                        break;
                    }
                    let backoff = backoff_secs(attempts);
                    warn!(relay = %url, attempts, backoff_secs = backoff, %err, "reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
            self.outboxes.lock().remove(&url);
        }
        self.outboxes.lock().remove(&url);
        self.with_health(&url, |h| h.connected = false);
    }

    /// One connection lifetime: subscribe and stream until the connection
    /// drops (error) or shutdown is signalled (`Ok`).
    async fn run_connection(&self, url: &str, attempts: &mut u32) -> Result<()> {
        let (ws, _) = connect_async(url).await?;
        info!(relay = %url, "connected");
        let (mut sink, mut stream) = ws.split();

        let req = subscription_request(&self.bot_pubkey, unix_now());
        sink.send(Message::Text(req)).await?;

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<PublishJob>();
        self.outboxes.lock().insert(url.to_string(), outbox_tx);
        self.with_health(url, |h| {
            h.connected = true;
            h.last_error = None;
        });

        let mut pending: HashMap<String, oneshot::Sender<std::result::Result<(), String>>> =
            HashMap::new();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(txt))) => {
                        self.handle_frame(url, &txt, attempts, &mut pending)?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(anyhow!("connection closed by relay"));
                    }
                    Some(Err(err)) => return Err(err.into()),
                    _ => {}
                },
                job = outbox_rx.recv() => {
                    if let Some(job) = job {
                        sink.send(Message::Text(job.payload)).await?;
                        pending.insert(job.event_id, job.ack);
                        self.with_health(url, |h| h.sent += 1);
                    }
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Interpret one relay frame. Returns an error only for frames that
    /// require tearing down the connection.
    fn handle_frame(
        &self,
        url: &str,
        txt: &str,
        attempts: &mut u32,
        pending: &mut HashMap<String, oneshot::Sender<std::result::Result<(), String>>>,
    ) -> Result<()> {
        let Ok(val) = serde_json::from_str::<Value>(txt) else {
            return Ok(());
        };
        let Some(arr) = val.as_array() else {
            return Ok(());
        };
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 3 => {
                if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                    // delivery proves the relay healthy again
                    *attempts = 0;
                    self.with_health(url, |h| {
                        h.received += 1;
                        h.failed_attempts = 0;
                        h.last_seen = Some(unix_now_ms());
                    });
                    let _ = self.events_tx.send(IncomingEvent {
                        event: ev,
                        relay: url.to_string(),
                    });
                }
            }
            Some("EOSE") => {}
            Some("OK") if arr.len() >= 3 => {
                let id = arr[1].as_str().unwrap_or_default().to_string();
                let accepted = arr[2].as_bool().unwrap_or(false);
                let message = arr
                    .get(3)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(ack) = pending.remove(&id) {
                    let _ = ack.send(if accepted { Ok(()) } else { Err(message) });
                }
            }
            Some("NOTICE") => {
                debug!(relay = %url, notice = %txt, "relay notice");
            }
            Some("CLOSED") => {
                return Err(anyhow!("subscription closed by relay: {txt}"));
            }
            _ => {}
        }
        Ok(())
    }

    /// Fan an event out to every live relay in parallel. Each per-relay
    /// publish gets its own deadline so one slow relay cannot stall the
    /// batch.
    pub async fn publish(&self, event: &Event) -> Vec<PublishResult> {
        let payload = json!(["EVENT", event]).to_string();
        let targets: Vec<(String, mpsc::UnboundedSender<PublishJob>)> = self
            .outboxes
            .lock()
            .iter()
            .map(|(url, tx)| (url.clone(), tx.clone()))
            .collect();

        let attempts = targets.into_iter().map(|(url, tx)| {
            let payload = payload.clone();
            let event_id = event.id.clone();
            let deadline = self.publish_timeout;
            async move {
                let (ack_tx, ack_rx) = oneshot::channel();
                let job = PublishJob {
                    payload,
                    event_id,
                    ack: ack_tx,
                };
                if tx.send(job).is_err() {
                    return PublishResult {
                        url,
                        ok: false,
                        error: Some("not connected".into()),
                    };
                }
                match tokio::time::timeout(deadline, ack_rx).await {
                    Ok(Ok(Ok(()))) => PublishResult {
                        url,
                        ok: true,
                        error: None,
                    },
                    Ok(Ok(Err(message))) => PublishResult {
                        url,
                        ok: false,
                        error: Some(message),
                    },
                    Ok(Err(_)) => PublishResult {
                        url,
                        ok: false,
                        error: Some("connection lost".into()),
                    },
                    Err(_) => PublishResult {
                        url,
                        ok: false,
                        error: Some("publish timed out".into()),
                    },
                }
            }
        });
        let results: Vec<PublishResult> = futures_util::future::join_all(attempts).await;

        for res in &results {
            if let Some(error) = &res.error {
                self.with_health(&res.url, |h| {
                    h.publish_errors += 1;
                });
                if is_policy_rejection(error) {
                    debug!(relay = %res.url, %error, "relay rejected publish by policy");
                } else {
                    warn!(relay = %res.url, %error, "publish failed");
                }
            }
        }
        results
    }

    /// Snapshot of all relay health records.
    pub fn health_snapshot(&self) -> HashMap<String, RelayHealth> {
        self.health.lock().clone()
    }

    /// Number of relays with a live connection.
    pub fn connected_count(&self) -> usize {
        self.health.lock().values().filter(|h| h.connected).count()
    }

    fn with_health(&self, url: &str, f: impl FnOnce(&mut RelayHealth)) {
        let mut health = self.health.lock();
        f(health.entry(url.to_string()).or_default());
    }
}

/// Exponential backoff: 5s, 10s, 20s, 40s, capped at 60s.
fn backoff_secs(attempts: u32) -> u64 {
    let shift = attempts.saturating_sub(1).min(6);
    (RECONNECT_BASE_SECS << shift).min(RECONNECT_CAP_SECS)
}

/// Relay policy rejections are expected noise, not failures worth warning.
fn is_policy_rejection(message: &str) -> bool {
    let m = message.to_lowercase();
    ["pow:", "restricted:", "blocked:", "rate-limited"]
        .iter()
        .any(|p| m.starts_with(p) || m.contains(p))
}

/// Startup subscription: one filter per consumed kind, scoped to events
/// tagging the bot and created after startup.
fn subscription_request(bot_pubkey: &str, since: u64) -> String {
    let kinds = [
        kind::PRIVATE_MESSAGE,
        kind::PUBLIC_POST,
        kind::RECEIPT,
        kind::BALANCE_QUERY,
    ];
    let mut req = vec![json!("REQ"), json!("zapai")];
    for k in kinds {
        req.push(json!({"kinds": [k], "#p": [bot_pubkey], "since": since}));
    }
    Value::Array(req).to_string()
}
