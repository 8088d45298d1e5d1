//! Inbound event delivery and circuit breaker inspection.

use std::collections::BTreeSet;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use conflux_types::breaker::BreakerSnapshot;
use conflux_types::event::InboundEvent;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DeliveryReport {
    pub event_type: String,
    /// Waiting steps the event resumed. Zero for duplicates and unmatched events.
    pub resumed: usize,
}

/// Mounted at `/api/v1` by the main router.
pub fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/events", post(deliver_event))
        .route("/events/awaited", get(awaited_event_types))
        .route("/breakers", get(list_breakers))
}

/// POST /api/v1/events - Deliver an event from the bus.
///
/// Delivery is at-least-once; redelivering an event with the same
/// `event_id` resumes nothing.
pub async fn deliver_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<ApiResponse<DeliveryReport>>, AppError> {
    let timer = RequestTimer::start();
    if event.event_type.trim().is_empty() {
        return Err(AppError::Validation("event_type must not be empty".to_string()));
    }

    let resumed = state.engine.deliver_event(&event);
    Ok(Json(timer.finish(DeliveryReport {
        event_type: event.event_type,
        resumed,
    })))
}

/// GET /api/v1/events/awaited - Event types some step is waiting for.
pub async fn awaited_event_types(
    State(state): State<AppState>,
) -> Json<ApiResponse<BTreeSet<String>>> {
    let timer = RequestTimer::start();
    Json(timer.finish(state.engine.awaited_event_types()))
}

/// GET /api/v1/breakers - Circuit breaker state per target.
pub async fn list_breakers(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<BreakerSnapshot>>> {
    let timer = RequestTimer::start();
    Json(timer.finish(state.engine.breakers()))
}
