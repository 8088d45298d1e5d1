//! Trigger API: start, inspect and control workflow instances.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use conflux_core::workflow::InstanceSnapshot;
use conflux_types::instance::{InstanceSummary, StateLogEntry};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Body of `POST /instances`.
#[derive(Debug, Deserialize)]
pub struct StartInstanceRequest {
    pub definition_id: String,
    /// Latest version when omitted.
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Defaults to the instance id.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListInstancesQuery {
    /// Only instances not yet in a terminal state.
    #[serde(default)]
    pub active: bool,
}

/// Mounted at `/api/v1` by the main router.
pub fn instance_routes() -> Router<AppState> {
    Router::new()
        .route("/instances", post(start_instance).get(list_instances))
        .route("/instances/{id}", get(get_state))
        .route("/instances/{id}/log", get(get_state_log))
        .route("/instances/{id}/pause", post(pause_instance))
        .route("/instances/{id}/resume", post(resume_instance))
        .route("/instances/{id}/cancel", post(cancel_instance))
}

fn instance_link(id: Uuid) -> String {
    format!("/api/v1/instances/{id}")
}

/// POST /api/v1/instances - Start an instance of a registered definition.
pub async fn start_instance(
    State(state): State<AppState>,
    Json(body): Json<StartInstanceRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();

    let id = state
        .engine
        .start_instance(&body.definition_id, body.version, body.context, body.correlation_id)
        .await?;

    let link = instance_link(id);
    Ok(Json(
        timer
            .finish(serde_json::json!({ "id": id }))
            .with_link("self", &link)
            .with_link("log", &format!("{link}/log")),
    ))
}

/// GET /api/v1/instances - Instance summaries, newest first.
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListInstancesQuery>,
) -> Result<Json<ApiResponse<Vec<InstanceSummary>>>, AppError> {
    let timer = RequestTimer::start();
    let instances = state.engine.list_instances(query.active).await?;
    Ok(Json(timer.finish(instances).with_link("self", "/api/v1/instances")))
}

/// GET /api/v1/instances/{id} - Consistent snapshot: state, ready steps,
/// execution history.
pub async fn get_state(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<InstanceSnapshot>>, AppError> {
    let timer = RequestTimer::start();
    let snapshot = state.engine.get_state(id).await?;
    Ok(Json(timer.finish(snapshot).with_link("self", &instance_link(id))))
}

/// GET /api/v1/instances/{id}/log - The raw state log.
pub async fn get_state_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<StateLogEntry>>>, AppError> {
    let timer = RequestTimer::start();
    let entries = state.engine.state_log(id).await?;
    Ok(Json(timer.finish(entries).with_link("instance", &instance_link(id))))
}

/// POST /api/v1/instances/{id}/pause
pub async fn pause_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<InstanceSnapshot>>, AppError> {
    let timer = RequestTimer::start();
    state.engine.pause(id).await?;
    snapshot_response(&state, id, timer).await
}

/// POST /api/v1/instances/{id}/resume
pub async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<InstanceSnapshot>>, AppError> {
    let timer = RequestTimer::start();
    state.engine.resume(id).await?;
    snapshot_response(&state, id, timer).await
}

/// POST /api/v1/instances/{id}/cancel - Request cancellation.
///
/// Returns immediately; in-flight calls settle within the cancel grace
/// period.
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<InstanceSnapshot>>, AppError> {
    let timer = RequestTimer::start();
    state.engine.cancel(id).await?;
    snapshot_response(&state, id, timer).await
}

async fn snapshot_response(
    state: &AppState,
    id: Uuid,
    timer: RequestTimer,
) -> Result<Json<ApiResponse<InstanceSnapshot>>, AppError> {
    let snapshot = state.engine.get_state(id).await?;
    Ok(Json(timer.finish(snapshot).with_link("self", &instance_link(id))))
}
