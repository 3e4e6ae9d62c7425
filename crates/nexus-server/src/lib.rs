//! # nexus-server
//!
//! HTTP API for the Nexus broker. Provides:
//!
//! - Provider registration, heartbeats, and context pushes
//! - Context queries for consumers
//! - Action submission, status, cancellation, and manual rollback
//! - Approval listing and resolution
//! - Audit export and chain verification
//! - Permission rule administration
//! - `/health` and Prometheus `/metrics`

pub mod api;
pub mod error;
pub mod metrics;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use nexus_config::schema::ServerConfig;
use nexus_runtime::Broker;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use error::{ApiError, ApiResult};
pub use metrics::{Gauges, Metrics};

/// Shared server state.
pub struct AppState {
    pub broker: Arc<Broker>,
    pub config: ServerConfig,
    pub metrics: Metrics,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    providers: usize,
    pending_approvals: usize,
    audit_halted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    halt_reason: Option<String>,
}

/// Build the Axum router over a constructed broker.
pub fn build_router(broker: Arc<Broker>) -> Router {
    let config = broker.config().server;
    let state = Arc::new(AppState {
        broker,
        config: config.clone(),
        metrics: Metrics::new(),
    });

    let api_routes = api::routes();
    let api_routes = if config.api_key.is_some() {
        api_routes.layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
    } else {
        api_routes
    };

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ))
        .with_state(state);

    if config.cors {
        router = router.layer(CorsLayer::permissive());
    }
    router.layer(TraceLayer::new_for_http())
}

/// Serve the API on `server.listen` until the broker shuts down.
pub async fn serve(broker: Arc<Broker>) -> nexus_core::Result<()> {
    let listen = broker.config().server.listen;
    let shutdown = broker.cancellation();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(%listen, "HTTP API listening");
    axum::serve(listener, build_router(broker))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP API stopped");
    Ok(())
}

/// Middleware that checks the Authorization header against the configured API key.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ref expected_key) = state.config.api_key {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if provided != Some(expected_key.as_str()) {
            warn!(path = %request.uri().path(), "unauthorized API request");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(request).await)
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    state.metrics.inc_http_requests();
    let response = next.run(request).await;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        state.metrics.inc_http_errors();
    }
    response
}

/// `503` once the audit log has halted: the broker refuses every audited
/// operation until an operator intervenes.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let broker = &state.broker;
    let halt_reason = broker.audit().halt_reason();
    let halted = halt_reason.is_some();
    let body = HealthResponse {
        status: if halted { "halted" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: broker.uptime().as_secs(),
        providers: broker.registry().len(),
        pending_approvals: broker.approvals().len(),
        audit_halted: halted,
        halt_reason,
    };
    let status = if halted {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

/// Prometheus-compatible metrics endpoint.
async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> (
    StatusCode,
    [(axum::http::header::HeaderName, &'static str); 1],
    String,
) {
    let broker = &state.broker;
    let gauges = Gauges {
        providers: broker.registry().len(),
        cached_records: broker.router().cached_records(),
        pending_approvals: broker.approvals().len(),
        tracked_actions: broker.engine().len(),
        audit_head_seq: broker.audit().head().seq,
        audit_halted: broker.audit().is_halted(),
    };
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render_prometheus(&gauges),
    )
}
