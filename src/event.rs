//! Nostr event model and kind constants.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string-like fields.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }
}

/// Event kinds the bot consumes and produces.
pub mod kind {
    /// User metadata (profile) events.
    pub const METADATA: u32 = 0;
    /// Plaintext public posts; mentions of the bot arrive as these.
    pub const PUBLIC_POST: u32 = 1;
    /// Encrypted direct messages.
    pub const PRIVATE_MESSAGE: u32 = 4;
    /// Payment receipts carrying an invoice and an embedded request.
    pub const RECEIPT: u32 = 9735;
    /// Client-solicited balance queries.
    pub const BALANCE_QUERY: u32 = 5050;
    /// Balance announcements published by the bot.
    pub const BALANCE_ANNOUNCEMENT: u32 = 5051;
}

/// Core Nostr event exchanged with relays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `9735`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body (plaintext or envelope ciphertext).
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [n, v, ..] if n == name => Some(v.as_str()),
            _ => None,
        })
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix time in milliseconds.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            kind: kind::PUBLIC_POST,
            created_at: 1,
            tags: vec![
                Tag::new(["p", "aa"]),
                Tag::new(["session", "s1"]),
                Tag::new(["p", "bb"]),
            ],
            content: "hi".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn tag_value_returns_first_match() {
        let ev = sample();
        assert_eq!(ev.tag_value("p"), Some("aa"));
        assert_eq!(ev.tag_value("session"), Some("s1"));
        assert_eq!(ev.tag_value("bolt11"), None);
    }

    #[test]
    fn event_hash_matches_reference() {
        let ev = sample();
        let expected = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            let bytes = Sha256::digest(serde_json::to_vec(&obj).unwrap());
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(event_hash(&ev).unwrap(), expected);
    }
}
