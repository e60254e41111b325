use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use ledgerflow_shared::{ApprovalDecision, InstanceDetail, InstanceSummary, WorkflowStats};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::workflows::{DispatchReport, EventSource, TriggerEvent, WorkflowDefinition};

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/definitions", get(list_definitions))
        .route("/stats", get(get_stats))
        .route("/instances", get(list_instances))
        .route("/instances/:id", get(get_instance))
        .route("/instances/:id/cancel", post(cancel_instance))
        .route("/events", post(fire_event))
        .route("/steps/:id/resolve", post(resolve_step))
}

#[derive(Debug, Deserialize)]
pub struct FireEventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub acting_user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveStepRequest {
    pub decision: String,
}

#[derive(Debug, Serialize)]
pub struct ResolveStepResponse {
    pub step_id: Uuid,
    pub decision: ApprovalDecision,
    /// False when the step had already been resolved or timed out
    pub applied: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub instance_id: Uuid,
    pub cancelled: bool,
}

async fn list_definitions(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowDefinition>> {
    let definitions = state
        .engine
        .catalog()
        .definitions()
        .iter()
        .map(|d| d.as_ref().clone())
        .collect();
    Json(definitions)
}

async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<WorkflowStats>> {
    Ok(Json(state.engine.stats().await?))
}

async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<InstanceSummary>>> {
    let instances = state.engine.list_instances(params.limit(), params.offset()).await?;
    let total = state.engine.stats().await?.total_instances;
    Ok(Json(PaginatedResponse::new(instances, &params, total)))
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InstanceDetail>> {
    Ok(Json(state.engine.instance_with_steps(id).await?))
}

async fn cancel_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.engine.cancel_instance(id).await?;
    Ok(Json(CancelResponse { instance_id: id, cancelled }))
}

async fn fire_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FireEventRequest>,
) -> ApiResult<(StatusCode, Json<DispatchReport>)> {
    if request.event_type.trim().is_empty() {
        return Err(AppError::BadRequest("event_type is required".to_string()));
    }

    let source = match request.acting_user_id {
        Some(user_id) => EventSource::User(user_id),
        None => EventSource::Api,
    };
    let event = TriggerEvent::new(request.event_type.trim(), request.payload, source);

    let report = state.engine.dispatch_event(event).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

async fn resolve_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveStepRequest>,
) -> ApiResult<Json<ResolveStepResponse>> {
    let decision: ApprovalDecision = request.decision.parse().map_err(AppError::BadRequest)?;
    let applied = state.engine.resolve_approval(id, decision).await?;

    Ok(Json(ResolveStepResponse {
        step_id: id,
        decision,
        applied,
    }))
}
