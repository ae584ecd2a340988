//! Caller-facing job endpoints: start, list, status, cancel.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use sweep_core::JobId;
use sweep_jobs::BulkJob;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::CallerContext;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

pub async fn start_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    body: Result<Json<dto::StartJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()),
    };
    if !caller.owns(body.mailbox_id) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "mailbox not owned by caller");
    }

    // Discovery keeps running in the background; the handle is not awaited.
    let started = match services.orchestrator.start(body.into_new_job(caller.user_id())).await {
        Ok(started) => started,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "job_id": started.job.id.to_string(),
            "status": started.job.status.as_str(),
            "job": dto::job_to_json(&started.job),
        })),
    )
        .into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    let mailboxes = match query.mailbox {
        Some(mailbox) if !caller.owns(mailbox) => {
            return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "mailbox not owned by caller");
        }
        Some(mailbox) => vec![mailbox],
        None => caller.mailboxes().to_vec(),
    };

    let mut jobs = Vec::new();
    for mailbox in mailboxes {
        match services.orchestrator.list(mailbox, limit).await {
            Ok(found) => jobs.extend(found),
            Err(e) => return errors::orchestrator_error_to_response(e),
        }
    }
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs.truncate(limit);

    let items = jobs.iter().map(dto::job_to_json).collect::<Vec<_>>();
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match find_owned(&services, &caller, &id).await {
        Ok(job) => (StatusCode::OK, Json(dto::job_to_json(&job))).into_response(),
        Err(resp) => resp,
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job = match find_owned(&services, &caller, &id).await {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    match services.orchestrator.cancel(job.id, job.mailbox_id).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "job": dto::job_to_json(&cancelled.job),
                "withdrawn": cancelled.withdrawn,
            })),
        )
            .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// The job, if the caller owns its mailbox. Anything else is a 404 so job
/// ids of other users do not leak.
async fn find_owned(
    services: &AppServices,
    caller: &CallerContext,
    id: &str,
) -> Result<BulkJob, axum::response::Response> {
    let job_id: JobId = id
        .parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))?;

    match services.store.get(job_id).await {
        Ok(Some(job)) if caller.owns(job.mailbox_id) => Ok(job),
        Ok(_) => Err(errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found")),
        Err(e) => Err(errors::store_error_to_response(e)),
    }
}
