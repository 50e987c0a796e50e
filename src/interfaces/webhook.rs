use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::driver::PauseGate;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::queue::{CompletionMessage, DurableQueue};

#[derive(Clone)]
pub struct WebhookState {
    pub queue: Arc<dyn DurableQueue>,
    /// Shared signing secret; `None` disables signature checks.
    pub secret: Option<String>,
    pub gate: PauseGate,
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/api/github/webhook", post(github_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Deserialize)]
struct WorkflowRunEvent {
    action: String,
    workflow_run: RunId,
    repository: Repository,
}

#[derive(Deserialize)]
struct RunId {
    id: i64,
}

#[derive(Deserialize)]
struct Repository {
    name: String,
    owner: Login,
}

#[derive(Deserialize)]
struct Login {
    login: String,
}

type Reply = (StatusCode, Json<serde_json::Value>);

fn reply(status: StatusCode, body: serde_json::Value) -> Reply {
    (status, Json(body))
}

async fn github_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    if let Some(secret) = &state.secret
        && !verify_signature(&headers, &body, secret)
    {
        warn!("Rejected webhook delivery with a missing or invalid signature");
        return reply(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "success": false, "error": "invalid signature" }),
        );
    }

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match event {
        "ping" => reply(StatusCode::OK, serde_json::json!({ "success": true, "pong": true })),
        "workflow_run" => {
            let payload: WorkflowRunEvent = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Malformed workflow_run payload: {}", e);
                    return reply(
                        StatusCode::BAD_REQUEST,
                        serde_json::json!({ "success": false, "error": e.to_string() }),
                    );
                }
            };
            if payload.action != "completed" {
                debug!("Ignoring workflow_run action {}", payload.action);
                return reply(StatusCode::NO_CONTENT, serde_json::json!({}));
            }

            let message = CompletionMessage {
                owner: payload.repository.owner.login,
                repository: payload.repository.name,
                run_id: payload.workflow_run.id,
            };
            match state.queue.enqueue(&message).await {
                Ok(()) => {
                    info!("Webhook enqueued {}", message);
                    reply(
                        StatusCode::ACCEPTED,
                        serde_json::json!({ "success": true, "queued": message }),
                    )
                }
                Err(e) => {
                    error!("Failed to enqueue {}: {}", message, e);
                    reply(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        serde_json::json!({ "success": false, "error": e.to_string() }),
                    )
                }
            }
        }
        other => {
            debug!("Ignoring webhook event {:?}", other);
            reply(StatusCode::NO_CONTENT, serde_json::json!({}))
        }
    }
}

async fn healthz(State(state): State<WebhookState>) -> Json<serde_json::Value> {
    let paused_for = state.gate.remaining().map(|d| d.as_secs());
    Json(serde_json::json!({
        "status": "ok",
        "paused": paused_for.is_some(),
        "paused_for_secs": paused_for,
    }))
}

/// `X-Hub-Signature-256: sha256=<hex hmac of the raw body>`.
fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Some(hex_sig) = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .and_then(|sig| sig.strip_prefix("sha256="))
    else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

// ── Server component ──

pub struct WebhookServer {
    addr: String,
    state: WebhookState,
    cancel: CancellationToken,
}

impl WebhookServer {
    pub fn new(host: &str, port: u16, state: WebhookState, cancel: CancellationToken) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            state,
            cancel,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for WebhookServer {
    async fn on_start(&mut self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        let app = build_router(self.state.clone());
        let cancel = self.cancel.clone();
        info!("Webhook receiver listening at http://{}", self.addr);

        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Webhook receiver crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Webhook receiver shutting down...");
        self.cancel.cancel();
        Ok(())
    }
}
