use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use sweep_core::DomainError;
use sweep_infra::{OrchestratorError, jobs::JobStoreError};

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        OrchestratorError::Domain(e @ DomainError::InvalidId(_)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string())
        }
        OrchestratorError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        e @ JobStoreError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        JobStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        JobStoreError::InvalidTransition(e) => json_error(StatusCode::BAD_REQUEST, "invalid_transition", e.to_string()),
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
