//! Webhook server — the single HTTP surface the gateway calls.
//!
//! `POST /webhook` acknowledges every well-formed envelope immediately;
//! message events are processed in a spawned task so downstream failures
//! never surface to the gateway caller (it redelivers on its own policy,
//! and our pipeline records failures for operators instead).

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::pipeline::{PipelineCoordinator, WebhookEnvelope};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<PipelineCoordinator>,
    secret: Arc<SecretString>,
}

/// Build the webhook router.
pub fn webhook_routes(coordinator: Arc<PipelineCoordinator>, secret: SecretString) -> Router {
    let state = AppState {
        coordinator,
        secret: Arc::new(secret),
    };

    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    // Shared-secret check first; wrong or missing key is rejected outright
    let presented = headers.get("apikey").and_then(|v| v.to_str().ok());
    if presented != Some(state.secret.expose_secret()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "success": false, "error": "invalid api key" })),
        );
    }

    let envelope: WebhookEnvelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Rejecting unparseable webhook body");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": e.to_string() })),
            );
        }
    };

    if envelope.event == "message" {
        // Ack now, process async: failures are recorded, never surfaced
        let coordinator = state.coordinator.clone();
        tokio::spawn(async move {
            let outcome = coordinator.process(&envelope).await;
            debug!(outcome = ?outcome, "Webhook event finished");
        });
    } else {
        // State-sync events are quick store writes; run them inline
        let outcome = state.coordinator.process(&envelope).await;
        debug!(outcome = ?outcome, "Webhook event finished");
    }

    (StatusCode::OK, Json(serde_json::json!({ "success": true })))
}

/// Serve the router until the process exits.
pub async fn serve(router: Router, bind_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "Webhook server started");
    axum::serve(listener, router).await
}
