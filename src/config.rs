//! Configuration loading from `.env` files and process environment.

use std::{env, path::PathBuf, str::FromStr};

use anyhow::{Context, Result};

/// Serializes tests that read or mutate the process environment.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bot secret key, hex or `nsec1…` bech32.
    pub private_key: String,
    /// AI backend credential.
    pub gemini_api_key: String,
    /// Relay URLs to subscribe and publish to.
    pub relays: Vec<String>,
    /// Display name used in the AI primer and thank-you posts.
    pub bot_name: String,
    /// Artificial delay before publishing a reply, in milliseconds.
    pub response_delay_ms: u64,
    /// Maximum in-flight processing tasks.
    pub max_concurrent: usize,
    /// Maximum pending tasks before enqueues are rejected.
    pub max_queue_size: usize,
    /// Per-attempt task timeout in milliseconds.
    pub queue_timeout_ms: u64,
    /// Token bucket capacity, shared by the global and per-user buckets.
    pub rate_limit_max_tokens: f64,
    /// Token bucket refill rate in tokens per second.
    pub rate_limit_refill_rate: f64,
    /// User metadata cache TTL in milliseconds.
    pub metadata_cache_ttl_ms: u64,
    /// Fast-path deadline for inline profile fetches, in milliseconds.
    pub metadata_fast_timeout_ms: u64,
    /// Reuse AI chat contexts across messages of a conversation.
    pub chat_session_reuse: bool,
    /// Chat context TTL after last use, in milliseconds.
    pub chat_session_ttl_ms: u64,
    /// Maximum cached chat contexts before LRU eviction.
    pub max_chat_sessions: usize,
    /// Enable the pre-reply memory summary step.
    pub memory_summary: bool,
    /// Minimum history length before a memory summary is requested.
    pub memory_summary_min_messages: usize,
    /// Port for the status/health HTTP surface.
    pub web_port: u16,
    /// Optional bearer password protecting `/status`.
    pub dashboard_password: Option<String>,
    /// Per-relay publish deadline in milliseconds.
    pub publish_timeout_ms: u64,
    /// Directory for the embedded store.
    pub store_root: PathBuf,
}

impl Settings {
    /// Load settings from the specified `.env` file, falling back to the
    /// process environment for anything the file doesn't set.
    pub fn from_env(path: &str) -> Result<Self> {
        let _ = dotenvy::from_filename(path);
        let private_key = env::var("BOT_PRIVATE_KEY").context("BOT_PRIVATE_KEY is required")?;
        let gemini_api_key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("GOOGLE_GENERATIVE_AI_API_KEY"))
            .context("GEMINI_API_KEY or GOOGLE_GENERATIVE_AI_API_KEY is required")?;
        let relays = csv_strings(env::var("NOSTR_RELAYS").context("NOSTR_RELAYS is required")?);
        if relays.is_empty() {
            anyhow::bail!("NOSTR_RELAYS must list at least one relay URL");
        }
        Ok(Self {
            private_key,
            gemini_api_key,
            relays,
            bot_name: env::var("BOT_NAME").unwrap_or_else(|_| "ZapAI".into()),
            response_delay_ms: parsed_or("BOT_RESPONSE_DELAY", 0),
            max_concurrent: parsed_or("MAX_CONCURRENT", 10),
            max_queue_size: parsed_or("MAX_QUEUE_SIZE", 10_000),
            queue_timeout_ms: parsed_or("QUEUE_TIMEOUT", 60_000),
            rate_limit_max_tokens: parsed_or("RATE_LIMIT_MAX_TOKENS", 50.0),
            rate_limit_refill_rate: parsed_or("RATE_LIMIT_REFILL_RATE", 5.0),
            metadata_cache_ttl_ms: parsed_or("USER_METADATA_CACHE_TTL_MS", 21_600_000),
            metadata_fast_timeout_ms: parsed_or("USER_METADATA_FAST_TIMEOUT_MS", 300),
            chat_session_reuse: bool_or("ENABLE_CHAT_SESSION_REUSE", true),
            chat_session_ttl_ms: parsed_or("CHAT_SESSION_TTL_MS", 1_800_000),
            max_chat_sessions: parsed_or("MAX_CHAT_SESSIONS", 5_000),
            memory_summary: bool_or("ENABLE_MEMORY_SUMMARY", false),
            memory_summary_min_messages: parsed_or("MEMORY_SUMMARY_MIN_MESSAGES", 16),
            web_port: parsed_or("WEB_PORT", 3000),
            dashboard_password: env::var("DASHBOARD_PASSWORD").ok().filter(|s| !s.is_empty()),
            publish_timeout_ms: parsed_or("RELAY_PUBLISH_TIMEOUT_MS", 8_000),
            store_root: PathBuf::from(env::var("STORE_ROOT").unwrap_or_else(|_| "data".into())),
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Parse an environment variable, falling back to `default` when unset
/// or unparseable.
fn parsed_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse a boolean environment variable accepting `1/0/true/false`.
fn bool_or(key: &str, default: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") => true,
        Ok("0") | Ok("false") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const ALL_VARS: &[&str] = &[
        "BOT_PRIVATE_KEY",
        "GEMINI_API_KEY",
        "GOOGLE_GENERATIVE_AI_API_KEY",
        "NOSTR_RELAYS",
        "BOT_NAME",
        "BOT_RESPONSE_DELAY",
        "MAX_CONCURRENT",
        "MAX_QUEUE_SIZE",
        "QUEUE_TIMEOUT",
        "RATE_LIMIT_MAX_TOKENS",
        "RATE_LIMIT_REFILL_RATE",
        "USER_METADATA_CACHE_TTL_MS",
        "USER_METADATA_FAST_TIMEOUT_MS",
        "ENABLE_CHAT_SESSION_REUSE",
        "CHAT_SESSION_TTL_MS",
        "MAX_CHAT_SESSIONS",
        "ENABLE_MEMORY_SUMMARY",
        "MEMORY_SUMMARY_MIN_MESSAGES",
        "WEB_PORT",
        "DASHBOARD_PASSWORD",
        "RELAY_PUBLISH_TIMEOUT_MS",
        "STORE_ROOT",
    ];

    fn clear_env() {
        for v in ALL_VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env_with_defaults() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BOT_PRIVATE_KEY=0000000000000000000000000000000000000000000000000000000000000001\n",
                "GEMINI_API_KEY=test-key\n",
                "NOSTR_RELAYS=\"wss://r1.example, wss://r2.example\"\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relays.len(), 2);
        assert_eq!(cfg.bot_name, "ZapAI");
        assert_eq!(cfg.max_concurrent, 10);
        assert_eq!(cfg.max_queue_size, 10_000);
        assert_eq!(cfg.rate_limit_max_tokens, 50.0);
        assert_eq!(cfg.rate_limit_refill_rate, 5.0);
        assert!(cfg.chat_session_reuse);
        assert!(!cfg.memory_summary);
        assert_eq!(cfg.web_port, 3000);
        assert!(cfg.dashboard_password.is_none());
        assert_eq!(cfg.publish_timeout_ms, 8_000);
        clear_env();
    }

    #[test]
    fn overrides_and_alternate_ai_key() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BOT_PRIVATE_KEY=abc\n",
                "GOOGLE_GENERATIVE_AI_API_KEY=alt-key\n",
                "NOSTR_RELAYS=wss://r1\n",
                "BOT_NAME=SatsBot\n",
                "MAX_CONCURRENT=3\n",
                "ENABLE_CHAT_SESSION_REUSE=false\n",
                "DASHBOARD_PASSWORD=hunter2\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.gemini_api_key, "alt-key");
        assert_eq!(cfg.bot_name, "SatsBot");
        assert_eq!(cfg.max_concurrent, 3);
        assert!(!cfg.chat_session_reuse);
        assert_eq!(cfg.dashboard_password.as_deref(), Some("hunter2"));
        clear_env();
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "GEMINI_API_KEY=k\nNOSTR_RELAYS=wss://r1\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
        clear_env();
    }

    #[test]
    fn empty_relay_list_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            "BOT_PRIVATE_KEY=abc\nGEMINI_API_KEY=k\nNOSTR_RELAYS=\n",
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
        clear_env();
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
