//! Worker invocation endpoint, called by whichever dispatch backend is active.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use sweep_auth::{SHARED_SECRET_HEADER, SIGNATURE_HEADER, WorkerCredentials};
use sweep_infra::WorkerOutcome;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub async fn invoke(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let credentials = WorkerCredentials {
        signature: header(&headers, SIGNATURE_HEADER),
        shared_secret: header(&headers, SHARED_SECRET_HEADER),
        body: &body,
    };
    if let Err(e) = services.worker_auth.verify(credentials) {
        tracing::warn!(error = %e, "worker call rejected");
        return errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", e.to_string());
    }

    let item = match serde_json::from_slice::<dto::WorkerPayload>(&body) {
        Ok(payload) => payload.into_item(),
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string()),
    };

    let outcome = services.worker.handle(&item).await;
    (status_for(&outcome), Json(outcome)).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A non-2xx answer invites the backend to redeliver, so only outcomes that
/// may succeed on a later attempt use 500.
fn status_for(outcome: &WorkerOutcome) -> StatusCode {
    match outcome {
        WorkerOutcome::Processed { .. }
        | WorkerOutcome::SkippedCancelled
        | WorkerOutcome::SkippedAlreadyProcessed
        | WorkerOutcome::SkippedNoRules => StatusCode::OK,
        WorkerOutcome::Invalid { .. } => StatusCode::BAD_REQUEST,
        WorkerOutcome::Failed { .. } | WorkerOutcome::Unavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
