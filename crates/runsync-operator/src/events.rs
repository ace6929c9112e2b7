//! Push-event and health HTTP endpoints
//!
//! - `POST /events/{topic}` with `{"id": "<run id>"}` invalidates one run
//!   and queues it immediately; unknown topics answer 404
//! - `GET /healthz` answers 503 while any controller is stalled

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use runsync_engine::{PublisherRegistry, Supervisor};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared state for the handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PublisherRegistry>,
    pub supervisor: Arc<Supervisor>,
}

/// Body of a push event
#[derive(Debug, Deserialize)]
pub struct RunEvent {
    pub id: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/events/{topic}", post(publish_event))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn publish_event(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(event): Json<RunEvent>,
) -> Response {
    if event.id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing run id").into_response();
    }
    if !state.registry.publish(&topic, &event.id) {
        return (StatusCode::NOT_FOUND, format!("unknown topic '{}'", topic)).into_response();
    }
    debug!(%topic, run = %event.id, "push event accepted");
    StatusCode::ACCEPTED.into_response()
}

async fn healthz(State(state): State<AppState>) -> Response {
    if state.supervisor.healthy() {
        return (StatusCode::OK, "ok").into_response();
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "stalled": state.supervisor.stalled() })),
    )
        .into_response()
}

/// Serve until `cancel` fires
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "event endpoint listening");
    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
