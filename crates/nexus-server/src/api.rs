//! `/api/v1` handlers. Each one is a thin shim over a broker component;
//! errors map through [`ApiError`].
//!
//! The API key authenticates the caller as a whole. Individual identities
//! (consumer, approver, admin actor) are asserted by that caller: when the
//! `x-nexus-actor` header is set it is the identity, and a body field naming
//! someone else is refused with `403`. Without the header, body fields are
//! taken as given.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, post},
};
use nexus_audit::{AuditPage, ChainReport};
use nexus_autonomy::PendingApproval;
use nexus_context::Provider;
use nexus_core::{
    ActionReport, ActionState, ContextRecord, ContextRequest, ContextResponse, DecisionOutcome,
    HealthStatus, NexusError, PermissionRule, ProposedAction, ProviderDescriptor, Resolution,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiResult;

/// Header naming who performs an admin mutation. Recorded in the audit log.
pub const ACTOR_HEADER: &str = "x-nexus-actor";
const DEFAULT_ACTOR: &str = "api";
const MAX_AUDIT_PAGE: usize = 1000;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/providers", post(register_provider).get(list_providers))
        .route(
            "/api/v1/providers/{id}",
            get(get_provider).delete(deregister_provider),
        )
        .route("/api/v1/providers/{id}/heartbeat", post(heartbeat))
        .route("/api/v1/providers/{id}/context", post(push_context))
        .route("/api/v1/context", post(gather_context))
        .route("/api/v1/actions", post(submit_action).get(list_actions))
        .route("/api/v1/actions/{id}", get(action_status))
        .route("/api/v1/actions/{id}/cancel", post(cancel_action))
        .route("/api/v1/actions/{id}/rollback", post(rollback_action))
        .route("/api/v1/actions/{id}/commit", post(commit_action))
        .route("/api/v1/approvals", get(list_approvals))
        .route("/api/v1/approvals/{id}/resolve", post(resolve_approval))
        .route("/api/v1/audit", get(export_audit))
        .route("/api/v1/audit/verify", get(verify_audit))
        .route("/api/v1/permissions/rules", get(list_rules).post(add_rule))
        .route("/api/v1/permissions/rules/{id}", delete(remove_rule))
}

fn header_actor(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn actor(headers: &HeaderMap) -> String {
    header_actor(headers).unwrap_or(DEFAULT_ACTOR).to_string()
}

/// Check a body-supplied identity against the actor header, if any.
fn bind_identity(headers: &HeaderMap, field: &str, claimed: &str) -> nexus_core::Result<()> {
    match header_actor(headers) {
        Some(actor) if actor != claimed => Err(NexusError::AccessDenied(format!(
            "{field} '{claimed}' does not match {ACTOR_HEADER} '{actor}'"
        ))),
        _ => Ok(()),
    }
}

// ── Providers ──────────────────────────────────────────────────

async fn register_provider(
    State(state): State<Arc<AppState>>,
    Json(descriptor): Json<ProviderDescriptor>,
) -> ApiResult<(StatusCode, Json<Provider>)> {
    let registry = state.broker.registry();
    let id = registry.register(descriptor)?;
    let provider = registry
        .get(&id)
        .ok_or_else(|| NexusError::ProviderNotFound(id.clone()))?;
    Ok((StatusCode::CREATED, Json(provider)))
}

async fn list_providers(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<Provider>> {
    Json(state.broker.registry().all())
}

async fn get_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Provider>> {
    let provider = state
        .broker
        .registry()
        .get(&id)
        .ok_or(NexusError::ProviderNotFound(id))?;
    Ok(Json(provider))
}

async fn deregister_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let dropped = state.broker.deregister_provider(&id)?;
    Ok(Json(serde_json::json!({ "id": id, "dropped_records": dropped })))
}

#[derive(Serialize)]
struct HeartbeatResponse {
    id: String,
    health: HealthStatus,
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let health = state.broker.registry().heartbeat(&id)?;
    Ok(Json(HeartbeatResponse { id, health }))
}

#[derive(Serialize)]
struct PushResponse {
    accepted: bool,
}

async fn push_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(record): Json<ContextRecord>,
) -> ApiResult<Json<PushResponse>> {
    let accepted = state.broker.router().push(&id, record)?;
    state.metrics.inc_context_pushes();
    Ok(Json(PushResponse { accepted }))
}

// ── Context ────────────────────────────────────────────────────

async fn gather_context(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ContextRequest>,
) -> ApiResult<Json<ContextResponse>> {
    bind_identity(&headers, "requester", &request.requester)?;
    let response = state.broker.router().gather(&request).await?;
    state
        .metrics
        .record_gather(response.records.len(), response.partial);
    Ok(Json(response))
}

// ── Actions ────────────────────────────────────────────────────

/// `202 Accepted` while the action waits for a human, `200` once settled.
async fn submit_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(action): Json<ProposedAction>,
) -> ApiResult<(StatusCode, Json<ActionReport>)> {
    bind_identity(&headers, "consumer", &action.consumer)?;
    state.metrics.inc_actions_submitted();
    let report = state.broker.engine().submit(action).await?;
    match report.decision.as_ref().map(|d| d.outcome) {
        Some(DecisionOutcome::AutoApproved) => state.metrics.inc_actions_auto_approved(),
        Some(DecisionOutcome::Blocked) => state.metrics.inc_actions_blocked(),
        Some(DecisionOutcome::ApprovalRequired) => state.metrics.inc_approvals_requested(),
        None => {}
    }
    let status = if report.state == ActionState::AwaitingApproval {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

async fn list_actions(State(state): State<Arc<AppState>>) -> Json<Vec<ActionReport>> {
    Json(state.broker.engine().list())
}

async fn action_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionReport>> {
    let report = state
        .broker
        .engine()
        .status(id)
        .ok_or(NexusError::ActionNotFound(id))?;
    Ok(Json(report))
}

async fn cancel_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<ActionReport>> {
    let report = state.broker.engine().cancel(id, &actor(&headers))?;
    Ok(Json(report))
}

async fn rollback_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<ActionReport>> {
    state.metrics.inc_rollbacks_requested();
    let report = state
        .broker
        .engine()
        .rollback_action(id, &actor(&headers))
        .await?;
    Ok(Json(report))
}

async fn commit_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<ActionReport>> {
    let report = state.broker.engine().commit(id, &actor(&headers))?;
    Ok(Json(report))
}

// ── Approvals ──────────────────────────────────────────────────

async fn list_approvals(State(state): State<Arc<AppState>>) -> Json<Vec<PendingApproval>> {
    Json(state.broker.approvals().pending())
}

#[derive(Deserialize)]
struct ResolveRequest {
    resolution: Resolution,
    /// Optional when the actor header is set.
    #[serde(default)]
    approver: Option<String>,
}

async fn resolve_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<Json<ActionReport>> {
    let approver = match req.approver {
        Some(approver) => {
            bind_identity(&headers, "approver", &approver)?;
            approver
        }
        None => header_actor(&headers)
            .ok_or_else(|| NexusError::AccessDenied(format!(
                "approver required: set {ACTOR_HEADER} or the approver field"
            )))?
            .to_string(),
    };
    let report = state
        .broker
        .engine()
        .resolve_approval(id, req.resolution, &approver)
        .await?;
    state.metrics.inc_approvals_resolved();
    info!(pending_id = %id, %approver, resolution = ?req.resolution, "approval resolved via API");
    Ok(Json(report))
}

// ── Audit ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AuditParams {
    #[serde(default)]
    from: u64,
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

async fn export_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditParams>,
) -> ApiResult<Json<AuditPage>> {
    let page = state
        .broker
        .audit()
        .export(params.from, params.limit.min(MAX_AUDIT_PAGE))?;
    Ok(Json(page))
}

async fn verify_audit(State(state): State<Arc<AppState>>) -> ApiResult<Json<ChainReport>> {
    Ok(Json(state.broker.audit().verify()?))
}

// ── Permissions ────────────────────────────────────────────────

async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<PermissionRule>> {
    Json(state.broker.guard().rules())
}

async fn add_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(rule): Json<PermissionRule>,
) -> ApiResult<(StatusCode, Json<PermissionRule>)> {
    state.broker.guard().add_rule(&actor(&headers), rule.clone())?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn remove_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<PermissionRule>> {
    let removed = state.broker.guard().remove_rule(&actor(&headers), &id)?;
    Ok(Json(removed))
}
