mod accounting;
mod ai;
mod breaker;
mod config;
mod dispatcher;
mod error;
mod event;
mod intent;
mod processor;
mod profiles;
mod queue;
mod ratelimit;
mod relay;
mod signer;
mod status;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::ai::{AiClient, AiConfig, GeminiProvider};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::Settings;
use crate::dispatcher::{Counters, Dispatcher, FingerprintCache};
use crate::processor::{Outbox, Processor};
use crate::profiles::ProfileCache;
use crate::queue::{QueueConfig, WorkQueue};
use crate::ratelimit::RateLimiter;
use crate::relay::RelaySupervisor;
use crate::signer::Signer;
use crate::status::StatusState;
use crate::store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "zapai", author, version, about = "Sats-metered AI reply bot for Nostr relays")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Connect to the relays and answer messages until interrupted.
    Serve,
    /// Fetch and print the status JSON of a running bot.
    Status {
        /// Status URL; defaults to the local bot on `WEB_PORT`.
        #[arg(long)]
        url: Option<String>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Serve => serve(cfg).await,
        Commands::Status { url } => {
            let url = url.unwrap_or_else(|| format!("http://127.0.0.1:{}/status", cfg.web_port));
            let body: serde_json::Value = reqwest::get(&url).await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
    }
}

/// Wire the pipeline together and run until ctrl-c.
async fn serve(cfg: Settings) -> anyhow::Result<()> {
    let signer = Arc::new(Signer::from_key(&cfg.private_key)?);
    info!(pubkey = %signer.public_key(), name = %cfg.bot_name, "starting bot");

    let store = Store::open(&cfg.store_root)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let limiter = Arc::new(RateLimiter::new(
        cfg.rate_limit_max_tokens,
        cfg.rate_limit_refill_rate,
    ));
    limiter.clone().spawn_sweeper(shutdown_rx.clone());

    let ai = Arc::new(AiClient::new(
        Arc::new(GeminiProvider::new(cfg.gemini_api_key.clone())),
        CircuitBreaker::new(BreakerConfig::default()),
        AiConfig {
            bot_name: cfg.bot_name.clone(),
            session_reuse: cfg.chat_session_reuse,
            session_ttl: Duration::from_millis(cfg.chat_session_ttl_ms),
            max_sessions: cfg.max_chat_sessions,
            memory_summary: cfg.memory_summary,
            memory_summary_min_messages: cfg.memory_summary_min_messages,
        },
    ));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let relays = RelaySupervisor::new(
        cfg.relays.clone(),
        signer.public_key().to_string(),
        Duration::from_millis(cfg.publish_timeout_ms),
        events_tx,
        shutdown_rx.clone(),
    );

    let counters = Arc::new(Counters::default());
    let outbox = Arc::new(Outbox::new(
        Arc::clone(&signer),
        Arc::clone(&relays),
        Arc::clone(&counters),
    ));

    let fingerprints = FingerprintCache::new();
    fingerprints.clone().spawn_sweeper(shutdown_rx.clone());

    let profiles = ProfileCache::new(
        cfg.relays.clone(),
        Duration::from_millis(cfg.metadata_cache_ttl_ms),
        Duration::from_millis(cfg.metadata_fast_timeout_ms),
    );

    let processor = Arc::new(Processor {
        signer: Arc::clone(&signer),
        store: store.clone(),
        ai: Arc::clone(&ai),
        profiles,
        fingerprints,
        outbox: Arc::clone(&outbox),
        counters: Arc::clone(&counters),
        response_delay: Duration::from_millis(cfg.response_delay_ms),
    });

    let queue = WorkQueue::new(
        QueueConfig {
            max_concurrent: cfg.max_concurrent,
            max_queue_size: cfg.max_queue_size,
            attempt_timeout: Duration::from_millis(cfg.queue_timeout_ms),
            retry_delay: Duration::from_secs(1),
        },
        processor,
    );

    let accounting = Arc::new(accounting::Accounting::new(
        store.clone(),
        Arc::clone(&outbox),
    ));

    let dispatcher = Dispatcher::new(
        Arc::clone(&signer),
        limiter.clone(),
        queue.clone(),
        accounting,
        outbox,
        Arc::clone(&counters),
    );

    relays.clone().start();
    tokio::spawn(dispatcher.run(events_rx, shutdown_rx.clone()));

    let status_state = Arc::new(StatusState {
        started: Instant::now(),
        counters,
        queue: queue.clone(),
        limiter,
        ai,
        relays,
        password: cfg.dashboard_password.clone(),
    });
    let addr: SocketAddr = ([0, 0, 0, 0], cfg.web_port).into();
    let mut status_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = status_shutdown.changed().await;
        };
        if let Err(err) = status::serve(addr, status_state, shutdown).await {
            tracing::error!(%err, "status server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    queue.shutdown().await;
    store.flush()?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zapai=info".parse().unwrap()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
