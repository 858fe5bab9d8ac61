//! User metadata cache with a fast inline path and background warming.
//!
//! Lookups consult a TTL'd cache first. On a miss, a relay-side metadata
//! query runs with a short deadline; if it cannot answer in time the
//! lookup returns `None` and the fetch keeps running in the background so
//! the next call hits the cache. Concurrent fetches for the same
//! principal are deduplicated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::event::{kind, Event};

/// Deadline for querying a single relay during a background fetch.
const PER_RELAY_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Profile fields published in metadata events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud06: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

struct CacheEntry {
    profile: Option<UserProfile>,
    fetched_at: Instant,
}

struct Shared {
    relays: Vec<String>,
    ttl: Duration,
    fast_timeout: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashSet<String>>,
}

/// TTL'd metadata cache over the configured relays. Cheap to clone; all
/// clones share one cache.
#[derive(Clone)]
pub struct ProfileCache {
    shared: Arc<Shared>,
}

impl ProfileCache {
    pub fn new(relays: Vec<String>, ttl: Duration, fast_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                relays,
                ttl,
                fast_timeout,
                cache: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Profile for a principal: cache hit, or a fast-path fetch bounded by
    /// the configured deadline. Returns `None` when nothing is known yet.
    pub async fn lookup(&self, pubkey: &str) -> Option<UserProfile> {
        {
            let cache = self.shared.cache.lock();
            if let Some(entry) = cache.get(pubkey) {
                if entry.fetched_at.elapsed() < self.shared.ttl {
                    return entry.profile.clone();
                }
            }
        }
        {
            let mut inflight = self.shared.inflight.lock();
            if inflight.contains(pubkey) {
                return None;
            }
            inflight.insert(pubkey.to_string());
        }
        let this = self.clone();
        let key = pubkey.to_string();
        let mut handle = tokio::spawn(async move { this.fetch_and_store(key).await });
        match tokio::time::timeout(self.shared.fast_timeout, &mut handle).await {
            Ok(Ok(profile)) => profile,
            Ok(Err(_)) => None,
            // deadline hit; the fetch keeps warming the cache
            Err(_) => None,
        }
    }

    async fn fetch_and_store(self, pubkey: String) -> Option<UserProfile> {
        let mut found = None;
        for relay in &self.shared.relays {
            match tokio::time::timeout(PER_RELAY_FETCH_TIMEOUT, query_metadata(relay, &pubkey))
                .await
            {
                Ok(Ok(Some(profile))) => {
                    found = Some(profile);
                    break;
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => debug!(%relay, %err, "metadata query failed"),
                Err(_) => debug!(%relay, "metadata query timed out"),
            }
        }
        self.shared.cache.lock().insert(
            pubkey.clone(),
            CacheEntry {
                profile: found.clone(),
                fetched_at: Instant::now(),
            },
        );
        self.shared.inflight.lock().remove(&pubkey);
        found
    }

    /// Number of cached entries (including negative ones).
    pub fn len(&self) -> usize {
        self.shared.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn prime(&self, pubkey: &str, profile: Option<UserProfile>) {
        self.shared.cache.lock().insert(
            pubkey.to_string(),
            CacheEntry {
                profile,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// One-shot metadata query: subscribe for the principal's latest metadata
/// event, read until it arrives or the relay reports end of stored events.
async fn query_metadata(relay: &str, pubkey: &str) -> Result<Option<UserProfile>> {
    let (mut ws, _) = connect_async(relay).await?;
    let req = json!(["REQ", "meta", {"kinds": [kind::METADATA], "authors": [pubkey], "limit": 1}]);
    ws.send(Message::Text(req.to_string())).await?;
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(txt) => {
                if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                    if let Some(arr) = val.as_array() {
                        match arr.first().and_then(|v| v.as_str()) {
                            Some("EVENT") if arr.len() >= 3 => {
                                if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                                    let profile =
                                        serde_json::from_str::<UserProfile>(&ev.content).ok();
                                    return Ok(profile);
                                }
                            }
                            Some("EOSE") => return Ok(None),
                            _ => {}
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn metadata_event(pubkey: &str, content: Value) -> Event {
        Event {
            id: "meta1".into(),
            pubkey: pubkey.into(),
            kind: kind::METADATA,
            created_at: 1,
            tags: vec![],
            content: content.to_string(),
            sig: String::new(),
        }
    }

    async fn spawn_metadata_relay(reply: Option<Value>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let req = ws.next().await.unwrap().unwrap();
            let val: Value = serde_json::from_str(req.to_text().unwrap()).unwrap();
            assert_eq!(val[2]["kinds"][0], kind::METADATA);
            let author = val[2]["authors"][0].as_str().unwrap().to_string();
            if let Some(content) = reply {
                let ev = metadata_event(&author, content);
                ws.send(TMsg::Text(json!(["EVENT", "meta", ev]).to_string()))
                    .await
                    .unwrap();
            }
            ws.send(TMsg::Text(json!(["EOSE", "meta"]).to_string()))
                .await
                .unwrap();
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn fetches_and_caches_profile() {
        let relay = spawn_metadata_relay(Some(
            json!({"name": "alice", "displayName": "Alice", "about": "hi"}),
        ))
        .await;
        let cache = ProfileCache::new(
            vec![relay],
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        let profile = cache.lookup("p1").await.unwrap();
        assert_eq!(profile.name.as_deref(), Some("alice"));
        assert_eq!(profile.display_name.as_deref(), Some("Alice"));
        assert_eq!(cache.len(), 1);
        // second lookup hits the cache, no relay round-trip
        let again = cache.lookup("p1").await.unwrap();
        assert_eq!(again, profile);
    }

    #[tokio::test]
    async fn missing_profile_is_cached_negative() {
        let relay = spawn_metadata_relay(None).await;
        let cache = ProfileCache::new(
            vec![relay],
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        assert!(cache.lookup("p1").await.is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn fast_timeout_returns_none_and_warms_later() {
        // a relay that never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let cache = ProfileCache::new(
            vec![format!("ws://{addr}")],
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        assert!(cache.lookup("p1").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_refetch() {
        let relay = spawn_metadata_relay(Some(json!({"name": "bob"}))).await;
        let cache = ProfileCache::new(
            vec![relay],
            Duration::from_millis(1),
            Duration::from_secs(2),
        );
        cache.prime("p1", None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let profile = cache.lookup("p1").await;
        assert_eq!(profile.unwrap().name.as_deref(), Some("bob"));
    }
}
