//! Read-only HTTP surface: status JSON and a health probe.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::ai::AiClient;
use crate::breaker::BreakerState;
use crate::dispatcher::Counters;
use crate::queue::WorkQueue;
use crate::ratelimit::RateLimiter;
use crate::relay::RelaySupervisor;

/// Queue length at which the health probe starts failing.
const HEALTH_QUEUE_LIMIT: usize = 9000;

/// Everything the status surface reports on.
pub struct StatusState {
    pub started: Instant,
    pub counters: Arc<Counters>,
    pub queue: WorkQueue,
    pub limiter: Arc<RateLimiter>,
    pub ai: Arc<AiClient>,
    pub relays: Arc<RelaySupervisor>,
    pub password: Option<String>,
}

/// Start the HTTP server exposing `/status` and `/healthz`.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<StatusState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = router(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Full status JSON, bearer-gated when a dashboard password is set.
async fn status(State(state): State<Arc<StatusState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(password) = &state.password {
        let expected = format!("Bearer {password}");
        let supplied = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if supplied != expected {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
        }
    }
    let body = json!({
        "uptimeSecs": state.started.elapsed().as_secs(),
        "counters": state.counters.snapshot(),
        "queue": state.queue.stats(),
        "rateLimiter": state.limiter.stats(),
        "ai": state.ai.stats(),
        "relays": state.relays.health_snapshot(),
    });
    (StatusCode::OK, Json(body))
}

/// 200 while the queue has headroom and the AI circuit is not open.
async fn healthz(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let queue_len = state.queue.len();
    let breaker = state.ai.breaker_state();
    let healthy = queue_len < HEALTH_QUEUE_LIMIT && breaker != BreakerState::Open;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "queueSize": queue_len,
            "breaker": breaker,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiConfig, ChatTurn, CompletionProvider, GenerationConfig};
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::error::BotError;
    use crate::queue::{QueueConfig, QueueTask, TaskHandler};
    use async_trait::async_trait;
    use tokio::sync::{mpsc, watch};
    use tokio::task;

    struct NoopProvider;

    #[async_trait]
    impl CompletionProvider for NoopProvider {
        async fn complete(
            &self,
            _turns: &[ChatTurn],
            _config: &GenerationConfig,
        ) -> Result<String, BotError> {
            Ok("ok".into())
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _task: &QueueTask) -> Result<(), BotError> {
            Ok(())
        }
    }

    fn state(password: Option<String>) -> Arc<StatusState> {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let relays = RelaySupervisor::new(
            vec![],
            "bot".into(),
            std::time::Duration::from_secs(1),
            events_tx,
            shutdown_rx,
        );
        Arc::new(StatusState {
            started: Instant::now(),
            counters: Arc::new(Counters::default()),
            queue: WorkQueue::new(QueueConfig::default(), Arc::new(NoopHandler)),
            limiter: Arc::new(RateLimiter::new(50.0, 5.0)),
            ai: Arc::new(AiClient::new(
                Arc::new(NoopProvider),
                CircuitBreaker::new(BreakerConfig::default()),
                AiConfig::default(),
            )),
            relays,
            password,
        })
    }

    async fn spawn_app(state: Arc<StatusState>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        task::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn status_reports_counters_and_queue() {
        let state = state(None);
        state.counters.bump_sent();
        let addr = spawn_app(state).await;
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["counters"]["sent"], 1);
        assert_eq!(body["queue"]["pending"], 0);
        assert_eq!(body["ai"]["breaker"], "closed");
    }

    #[tokio::test]
    async fn healthz_is_ok_when_idle() {
        let addr = spawn_app(state(None)).await;
        let resp = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn status_requires_password_when_set() {
        let addr = spawn_app(state(Some("hunter2".into()))).await;
        let resp = reqwest::get(format!("http://{addr}/status")).await.unwrap();
        assert_eq!(resp.status(), 401);

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{addr}/status"))
            .header("authorization", "Bearer hunter2")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn healthz_needs_no_password() {
        let addr = spawn_app(state(Some("hunter2".into()))).await;
        let resp = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }
}
