//! Embedded session, balance, and receipt store backed by sled.
//!
//! Key layout in the default tree:
//!
//! - `session:meta:<principal>:<session-id>` — session metadata
//! - `session:messages:<principal>:<session-id>` — message log, newest 1000
//! - `user:sessions:<principal>` — session ids in insertion order
//! - `event:processed:<event-id>` — exactly-once marker
//! - `balance:<principal>` — balance record
//! - `zap:<principal>:<timestamp-ms>` — receipt records
//!
//! Range reads use sled's lexicographic prefix scans. Balance transitions
//! go through compare-and-swap so racing credits both land and a racing
//! debit observes insufficient funds instead of losing an update.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::event::unix_now_ms;
use crate::profiles::UserProfile;

/// Message log entries kept per session; older entries are dropped.
pub const MESSAGE_LOG_CAP: usize = 1000;

/// Who authored a message record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    User,
    Bot,
}

/// What a message record carries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Question,
    Response,
    BalanceInfo,
    System,
}

/// A single entry in a session's append-only message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub direction: Direction,
    pub text: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    pub classification: Classification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_kind: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
}

/// Metadata kept alongside each session's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub last_message_at: u64,
    pub message_count: usize,
    /// `dm`, `public`, or another channel label.
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Per-principal balance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRecord {
    pub pubkey: String,
    pub balance: u64,
    pub last_updated: u64,
}

/// Exactly-once marker for a processed event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMarker {
    pub session_id: String,
    pub timestamp: u64,
}

/// Outcome of a debit attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DebitOutcome {
    /// Debited; carries the new balance.
    Debited(u64),
    /// Refused; carries the current balance.
    Insufficient(u64),
}

/// Outcome of appending a user message bound to an event id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendOutcome {
    Appended,
    /// Another worker already processed this event id.
    DuplicateEvent,
}

/// Durable store for sessions, balances, and receipts.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    // serializes log read-modify-write appends
    append_lock: std::sync::Arc<Mutex<()>>,
}

impl Store {
    /// Open (or create) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let db = sled::open(root).context("opening embedded store")?;
        Ok(Self {
            db,
            append_lock: std::sync::Arc::new(Mutex::new(())),
        })
    }

    /// Record an event id as processed. Returns `false` when the marker
    /// already existed, i.e. another worker won the race.
    pub fn mark_processed(&self, event_id: &str, session_id: &str) -> Result<bool> {
        let key = format!("event:processed:{event_id}");
        let marker = ProcessedMarker {
            session_id: session_id.to_string(),
            timestamp: unix_now_ms(),
        };
        let value = serde_json::to_vec(&marker)?;
        let res = self
            .db
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(value))?;
        Ok(res.is_ok())
    }

    /// Append a user message bound to its source event id. The marker is
    /// claimed first so a replayed event becomes a no-op.
    pub fn append_with_marker(
        &self,
        pubkey: &str,
        session_id: &str,
        origin: &str,
        record: MessageRecord,
        event_id: &str,
    ) -> Result<AppendOutcome> {
        if !self.mark_processed(event_id, session_id)? {
            return Ok(AppendOutcome::DuplicateEvent);
        }
        self.append_message(pubkey, session_id, origin, record)?;
        Ok(AppendOutcome::Appended)
    }

    /// Append a message to a session's log, creating the session lazily.
    pub fn append_message(
        &self,
        pubkey: &str,
        session_id: &str,
        origin: &str,
        record: MessageRecord,
    ) -> Result<()> {
        let _guard = self.append_lock.lock();
        let log_key = format!("session:messages:{pubkey}:{session_id}");
        let mut log: Vec<MessageRecord> = match self.db.get(log_key.as_bytes())? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        let timestamp = record.timestamp;
        log.push(record);
        if log.len() > MESSAGE_LOG_CAP {
            let excess = log.len() - MESSAGE_LOG_CAP;
            log.drain(..excess);
        }
        let count = log.len();
        self.db
            .insert(log_key.as_bytes(), serde_json::to_vec(&log)?)?;

        let meta_key = format!("session:meta:{pubkey}:{session_id}");
        let mut meta: SessionMeta = match self.db.get(meta_key.as_bytes())? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => SessionMeta {
                session_id: session_id.to_string(),
                pubkey: pubkey.to_string(),
                created_at: timestamp,
                last_message_at: timestamp,
                message_count: 0,
                origin: origin.to_string(),
                label: None,
            },
        };
        meta.last_message_at = meta.last_message_at.max(timestamp);
        meta.message_count = count;
        self.db
            .insert(meta_key.as_bytes(), serde_json::to_vec(&meta)?)?;

        let index_key = format!("user:sessions:{pubkey}");
        let mut sessions: Vec<String> = match self.db.get(index_key.as_bytes())? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        if !sessions.iter().any(|s| s == session_id) {
            sessions.push(session_id.to_string());
            self.db
                .insert(index_key.as_bytes(), serde_json::to_vec(&sessions)?)?;
        }
        Ok(())
    }

    /// The most recent `limit` messages of one session, oldest first.
    pub fn messages(&self, pubkey: &str, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let key = format!("session:messages:{pubkey}:{session_id}");
        let mut log: Vec<MessageRecord> = match self.db.get(key.as_bytes())? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        if log.len() > limit {
            let excess = log.len() - limit;
            log.drain(..excess);
        }
        Ok(log)
    }

    /// Union of all of a principal's session logs, sorted by timestamp and
    /// truncated to the most recent `limit` messages.
    pub fn messages_for_principal(&self, pubkey: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let mut all = Vec::new();
        for session_id in self.sessions_for(pubkey)? {
            all.extend(self.messages(pubkey, &session_id, MESSAGE_LOG_CAP)?);
        }
        all.sort_by_key(|m| m.timestamp);
        if all.len() > limit {
            let excess = all.len() - limit;
            all.drain(..excess);
        }
        Ok(all)
    }

    /// Session ids for a principal in insertion order.
    pub fn sessions_for(&self, pubkey: &str) -> Result<Vec<String>> {
        let key = format!("user:sessions:{pubkey}");
        Ok(match self.db.get(key.as_bytes())? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        })
    }

    /// Session metadata, if the session exists.
    pub fn session_meta(&self, pubkey: &str, session_id: &str) -> Result<Option<SessionMeta>> {
        let key = format!("session:meta:{pubkey}:{session_id}");
        Ok(match self.db.get(key.as_bytes())? {
            Some(raw) => Some(serde_json::from_slice(&raw)?),
            None => None,
        })
    }

    /// Current balance for a principal, zero when unknown.
    pub fn balance(&self, pubkey: &str) -> Result<u64> {
        let key = format!("balance:{pubkey}");
        Ok(match self.db.get(key.as_bytes())? {
            Some(raw) => serde_json::from_slice::<BalanceRecord>(&raw)?.balance,
            None => 0,
        })
    }

    /// Atomically add `amount` sats to a principal's balance.
    pub fn credit(&self, pubkey: &str, amount: u64) -> Result<u64> {
        let key = format!("balance:{pubkey}");
        loop {
            let current = self.db.get(key.as_bytes())?;
            let balance = match current.as_ref() {
                Some(raw) => serde_json::from_slice::<BalanceRecord>(raw)?.balance,
                None => 0,
            };
            let updated = BalanceRecord {
                pubkey: pubkey.to_string(),
                balance: balance + amount,
                last_updated: unix_now_ms(),
            };
            let swap = self.db.compare_and_swap(
                key.as_bytes(),
                current.as_ref().map(|v| v.as_ref()),
                Some(serde_json::to_vec(&updated)?),
            )?;
            if swap.is_ok() {
                return Ok(updated.balance);
            }
        }
    }

    /// Atomically subtract `cost` sats, refusing to go below zero.
    pub fn debit(&self, pubkey: &str, cost: u64) -> Result<DebitOutcome> {
        let key = format!("balance:{pubkey}");
        loop {
            let current = self.db.get(key.as_bytes())?;
            let balance = match current.as_ref() {
                Some(raw) => serde_json::from_slice::<BalanceRecord>(raw)?.balance,
                None => 0,
            };
            if balance < cost {
                return Ok(DebitOutcome::Insufficient(balance));
            }
            let updated = BalanceRecord {
                pubkey: pubkey.to_string(),
                balance: balance - cost,
                last_updated: unix_now_ms(),
            };
            let swap = self.db.compare_and_swap(
                key.as_bytes(),
                current.as_ref().map(|v| v.as_ref()),
                Some(serde_json::to_vec(&updated)?),
            )?;
            if swap.is_ok() {
                return Ok(DebitOutcome::Debited(updated.balance));
            }
        }
    }

    /// Persist a parsed receipt under `zap:<sender>:<timestamp-ms>`.
    pub fn record_receipt(&self, sender: &str, receipt: &impl Serialize) -> Result<()> {
        let key = format!("zap:{sender}:{}", unix_now_ms());
        self.db
            .insert(key.as_bytes(), serde_json::to_vec(receipt)?)?;
        Ok(())
    }

    /// Receipts recorded for a principal, oldest first.
    pub fn receipts_for(&self, pubkey: &str) -> Result<Vec<serde_json::Value>> {
        let prefix = format!("zap:{pubkey}:");
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("flushing store")?;
        Ok(())
    }
}

/// Generate an opaque message identifier.
pub fn message_id() -> String {
    let mut raw = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Stable synthesized session id for principals that never supplied one.
pub fn synthesized_session_id(origin: &str, pubkey: &str) -> String {
    let head = &pubkey[..pubkey.len().min(8)];
    format!("{origin}-{head}")
}
