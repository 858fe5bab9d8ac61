//! AI completion client: provider abstraction, Gemini backend, and the
//! per-conversation chat context cache.
//!
//! Every completion runs inside the circuit breaker with a per-call
//! deadline, wrapped in a short retry loop with exponential backoff. When
//! everything fails the caller still gets a reply: one of a fixed set of
//! apology strings.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::BotError;
use crate::profiles::UserProfile;
use crate::store::{Direction, MessageRecord};

/// Most history messages seeded into a fresh chat context.
const SEED_HISTORY_LIMIT: usize = 40;

/// Extra attempts around the breaker-protected call.
const MAX_RETRIES: u32 = 2;

/// Replies served when the backend is unreachable.
const FALLBACK_REPLIES: &[&str] = &[
    "Sorry, my thoughts are scrambled right now. Please try again in a moment.",
    "I couldn't reach my brain just then. Give me a minute and ask again.",
    "Something went wrong while composing a reply. Please try once more shortly.",
];

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One turn of a multi-turn conversation sent to the backend.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Sampling settings for a completion request.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 1024,
        }
    }
}

/// Backend seam; tests inject a scripted implementation.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        config: &GenerationConfig,
    ) -> Result<String, BotError>;
}

/// Google Gemini `generateContent` backend.
pub struct GeminiProvider {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const GEMINI_MODEL: &str = "gemini-2.0-flash";

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: GEMINI_BASE_URL.to_string(),
            model: GEMINI_MODEL.to_string(),
            api_key,
        }
    }

    /// Point the provider at a different host (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        config: &GenerationConfig,
    ) -> Result<String, BotError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let contents: Vec<_> = turns
            .iter()
            .map(|t| json!({"role": t.role.as_str(), "parts": [{"text": t.text}]}))
            .collect();
        let body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": config.temperature,
                "maxOutputTokens": config.max_output_tokens,
            },
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BotError::Transient(format!("ai request failed: {e}")))?;
        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BotError::Transient(format!("ai response read failed: {e}")))?;
        if !status.is_success() {
            return Err(BotError::Rejected(format!(
                "ai backend returned {status}: {}",
                payload["error"]["message"].as_str().unwrap_or("unknown")
            )));
        }
        let text = payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(BotError::Rejected("ai backend returned no text".into()));
        }
        Ok(text)
    }
}

/// Tunables for the client and its context cache.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub bot_name: String,
    pub session_reuse: bool,
    pub session_ttl: Duration,
    pub max_sessions: usize,
    pub memory_summary: bool,
    pub memory_summary_min_messages: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            bot_name: "ZapAI".into(),
            session_reuse: true,
            session_ttl: Duration::from_secs(1800),
            max_sessions: 5000,
            memory_summary: false,
            memory_summary_min_messages: 16,
        }
    }
}

struct ChatContext {
    turns: Vec<ChatTurn>,
    last_used: Instant,
}

/// One completion request from the processor.
pub struct AiRequest<'a> {
    pub text: &'a str,
    pub history: &'a [MessageRecord],
    pub user_context: Option<&'a UserProfile>,
    /// `principal:session-id`; enables chat context reuse.
    pub conversation_key: Option<String>,
}

/// Counters exposed on the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct AiStats {
    pub calls: u64,
    pub fallbacks: u64,
    pub cached_sessions: usize,
    pub breaker: BreakerState,
}

/// Breaker-protected completion client with reusable chat contexts.
pub struct AiClient {
    provider: Arc<dyn CompletionProvider>,
    breaker: CircuitBreaker,
    cfg: AiConfig,
    sessions: Mutex<LruCache<String, ChatContext>>,
    calls: AtomicU64,
    fallbacks: AtomicU64,
}

impl AiClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, breaker: CircuitBreaker, cfg: AiConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.max_sessions.max(1)).expect("non-zero capacity");
        Self {
            provider,
            breaker,
            cfg,
            sessions: Mutex::new(LruCache::new(capacity)),
            calls: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Produce a reply. Never fails: after the retries are exhausted (or
    /// the breaker rejects outright) one of the fallback strings is
    /// returned instead.
    pub async fn respond(&self, req: AiRequest<'_>) -> String {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let key = if self.cfg.session_reuse {
            req.conversation_key.clone()
        } else {
            None
        };
        let turns = self.assemble_turns(key.as_deref(), &req).await;
        let config = GenerationConfig::default();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.breaker.call(self.provider.complete(&turns, &config)).await {
                Ok(text) => {
                    if let Some(key) = &key {
                        self.store_context(key.clone(), &turns, &text);
                    }
                    return text;
                }
                Err(BotError::Overloaded(reason)) => {
                    debug!(%reason, "ai call rejected by breaker");
                    return self.fallback();
                }
                Err(err) if attempt <= MAX_RETRIES => {
                    let backoff = Duration::from_millis((1000u64 << (attempt - 1)).min(5000));
                    warn!(%err, attempt, "ai call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    warn!(%err, "ai call failed after retries");
                    return self.fallback();
                }
            }
        }
    }

    /// Reuse a cached context when fresh, otherwise seed a new one from
    /// the primer and recent history.
    async fn assemble_turns(&self, key: Option<&str>, req: &AiRequest<'_>) -> Vec<ChatTurn> {
        if let Some(key) = key {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(key) {
                Some(ctx) if ctx.last_used.elapsed() < self.cfg.session_ttl => {
                    ctx.last_used = Instant::now();
                    let mut turns = ctx.turns.clone();
                    turns.push(ChatTurn::user(req.text));
                    return turns;
                }
                Some(_) => {
                    sessions.pop(key);
                }
                None => {}
            }
        }
        let mut turns = vec![
            ChatTurn::user(self.primer(req.user_context)),
            ChatTurn::model("Understood."),
        ];
        if let Some(summary) = self.memory_summary(req.history).await {
            turns.push(ChatTurn::user(format!(
                "Context about this user from earlier conversations: {summary}"
            )));
            turns.push(ChatTurn::model("Noted."));
        }
        let skip = req.history.len().saturating_sub(SEED_HISTORY_LIMIT);
        for record in &req.history[skip..] {
            let turn = match record.direction {
                Direction::User => ChatTurn::user(record.text.clone()),
                Direction::Bot => ChatTurn::model(record.text.clone()),
            };
            turns.push(turn);
        }
        turns.push(ChatTurn::user(req.text));
        turns
    }

    fn primer(&self, profile: Option<&UserProfile>) -> String {
        let date = chrono::Utc::now().format("%Y-%m-%d");
        let mut primer = format!(
            "You are {}, a helpful assistant replying to messages on a \
             decentralized social network. Today's date is {date}. Keep \
             replies concise and conversational.",
            self.cfg.bot_name
        );
        if let Some(profile) = profile {
            if let Some(name) = profile.display_name.as_deref().or(profile.name.as_deref()) {
                primer.push_str(&format!(" You are talking to {name}."));
            }
            if let Some(about) = profile.about.as_deref() {
                primer.push_str(&format!(" They describe themselves as: {about}."));
            }
        }
        primer
    }

    /// Ask the backend for a compact JSON summary of a long history and
    /// return it as primer material. Failures are swallowed.
    async fn memory_summary(&self, history: &[MessageRecord]) -> Option<String> {
        if !self.cfg.memory_summary || history.len() < self.cfg.memory_summary_min_messages {
            return None;
        }
        let transcript: String = history
            .iter()
            .map(|m| {
                let who = match m.direction {
                    Direction::User => "user",
                    Direction::Bot => "bot",
                };
                format!("{who}: {}\n", m.text)
            })
            .collect();
        let prompt = format!(
            "Summarize this conversation as a JSON object with keys \
             \"summary\", \"facts\", and \"preferences\". Reply with JSON \
             only.\n\n{transcript}"
        );
        let config = GenerationConfig {
            temperature: 0.1,
            max_output_tokens: 512,
        };
        let turns = [ChatTurn::user(prompt)];
        match self.breaker.call(self.provider.complete(&turns, &config)).await {
            Ok(raw) => {
                let trimmed = raw
                    .trim()
                    .trim_start_matches("```json")
                    .trim_start_matches("```")
                    .trim_end_matches("```")
                    .trim();
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(value) => Some(value.to_string()),
                    Err(err) => {
                        debug!(%err, "memory summary was not valid json");
                        None
                    }
                }
            }
            Err(err) => {
                debug!(%err, "memory summary request failed");
                None
            }
        }
    }

    fn store_context(&self, key: String, turns: &[ChatTurn], reply: &str) {
        let mut context_turns = turns.to_vec();
        context_turns.push(ChatTurn::model(reply));
        self.sessions.lock().put(
            key,
            ChatContext {
                turns: context_turns,
                last_used: Instant::now(),
            },
        );
    }

    fn fallback(&self) -> String {
        let n = self.fallbacks.fetch_add(1, Ordering::Relaxed);
        FALLBACK_REPLIES[(n as usize) % FALLBACK_REPLIES.len()].to_string()
    }

    pub fn stats(&self) -> AiStats {
        AiStats {
            calls: self.calls.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cached_sessions: self.sessions.lock().len(),
            breaker: self.breaker.state(),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}
