//! Definition registration and lookup handlers.
//!
//! Definitions are accepted as YAML or JSON text, validated, and stored as
//! immutable `(id, version)` rows.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use conflux_core::workflow::definition::parse_definition;
use conflux_types::workflow::{DefinitionRef, WorkflowDefinition};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Mounted at `/api/v1` by the main router.
pub fn definition_routes() -> Router<AppState> {
    Router::new()
        .route("/definitions", post(register_definition).get(list_definitions))
        .route("/definitions/{id}", get(get_latest_definition))
        .route("/definitions/{id}/versions/{version}", get(get_definition_version))
}

fn version_link(def: &DefinitionRef) -> String {
    format!("/api/v1/definitions/{}/versions/{}", def.id, def.version)
}

/// POST /api/v1/definitions - Validate and register a definition.
///
/// A cyclic or otherwise invalid definition is rejected with 400 and never
/// stored.
pub async fn register_definition(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ApiResponse<DefinitionRef>>, AppError> {
    let timer = RequestTimer::start();

    let def = parse_definition(&body)?;
    let reference = state.engine.register_definition(def).await?;

    let link = version_link(&reference);
    Ok(Json(timer.finish(reference).with_link("self", &link)))
}

/// GET /api/v1/definitions - Every stored `(id, version)` pair.
pub async fn list_definitions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<DefinitionRef>>>, AppError> {
    let timer = RequestTimer::start();
    let defs = state.engine.list_definitions().await?;
    Ok(Json(timer.finish(defs).with_link("self", "/api/v1/definitions")))
}

/// GET /api/v1/definitions/{id} - Latest version of a definition.
pub async fn get_latest_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let def = state.engine.get_definition(&id, None).await?;
    let link = version_link(&def.reference());
    Ok(Json(timer.finish((*def).clone()).with_link("self", &link)))
}

/// GET /api/v1/definitions/{id}/versions/{version}
pub async fn get_definition_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u32)>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let def = state.engine.get_definition(&id, Some(version)).await?;
    let link = version_link(&def.reference());
    Ok(Json(timer.finish((*def).clone()).with_link("self", &link)))
}
