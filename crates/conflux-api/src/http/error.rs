//! Application error type mapping engine errors to HTTP status codes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use conflux_core::workflow::{DefinitionError, EngineError};
use conflux_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Error from the workflow engine.
    Engine(EngineError),
    /// Malformed request.
    Validation(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        AppError::Engine(EngineError::Definition(e))
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Engine(e) => match e {
                EngineError::Definition(DefinitionError::NotFound { .. }) => {
                    (StatusCode::NOT_FOUND, "DEFINITION_NOT_FOUND")
                }
                EngineError::Definition(DefinitionError::VersionConflict(_)) => {
                    (StatusCode::CONFLICT, "VERSION_CONFLICT")
                }
                EngineError::Definition(
                    DefinitionError::Repository(_) | DefinitionError::Io(_),
                ) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
                EngineError::Definition(_) => (StatusCode::BAD_REQUEST, "INVALID_DEFINITION"),
                EngineError::InstanceNotFound(_)
                | EngineError::Repository(RepositoryError::NotFound) => {
                    (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND")
                }
                EngineError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
                EngineError::NotActive(_) => (StatusCode::CONFLICT, "INSTANCE_NOT_ACTIVE"),
                EngineError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
                EngineError::Repository(_) | EngineError::Replay(_) | EngineError::Journal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let message = match &self {
            AppError::Validation(msg) => msg.clone(),
            AppError::Engine(e) => e.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        (status, Json(ApiResponse::error(code, &message, String::new(), 0))).into_response()
    }
}
