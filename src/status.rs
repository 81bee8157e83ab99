//! HTTP status surface.
//!
//! - `GET /health`: liveness plus feed connection state
//! - `GET /metrics`: pipeline counters and uptime
//! - `POST /analyses/{id}/cancel`: operator cancellation of a running analysis
//!
//! When an API key is configured every route except health and metrics
//! requires `Authorization: Bearer <key>`.

use crate::pipeline::Pipeline;
use crate::shutdown::ShutdownSignal;
use crate::source::FeedStats;
use crate::stats::format_uptime;
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state of the status server.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub feed: Arc<FeedStats>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, feed: Arc<FeedStats>) -> Self {
        Self {
            pipeline,
            feed,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }
}

/// Build the status router.
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/analyses/{id}/cancel", post(cancel_analysis))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Serve the status router until shutdown.
pub async fn serve(
    port: u16,
    state: AppState,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server listening on {}", addr);

    let mut listener_shutdown = shutdown.subscribe();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { listener_shutdown.recv().await })
        .await
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(api_key) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if token == api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let feed = if state.feed.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(json!({ "status": "ok", "feed": feed }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let pipeline = &state.pipeline;
    let uptime = pipeline.stats().uptime_seconds();
    let orchestrator = pipeline.orchestrator();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": format_uptime(uptime),
        "events": pipeline.stats().snapshot(),
        "feed": state.feed.snapshot(),
        "queue": {
            "depth": pipeline.queue().len(),
            "draining": pipeline.queue().is_draining()
        },
        "analysis": {
            "in_flight": orchestrator.in_flight(),
            "capacity": orchestrator.capacity(),
            "ids": orchestrator.in_flight_ids()
        },
        "dedup": pipeline.dedup().stats(),
        "status": "running"
    }))
}

async fn cancel_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if state.pipeline.orchestrator().cancel(&id) {
        (
            StatusCode::ACCEPTED,
            Json(json!({ "id": id, "status": "cancelled" })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "id": id, "status": "not_analyzing" })),
        )
    }
}
