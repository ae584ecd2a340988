use axum::{
    Router,
    routing::{get, post},
};

pub mod bulk;
pub mod system;
pub mod worker;

/// Router for all caller-authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/bulk/jobs", post(bulk::start_job).get(bulk::list_jobs))
        .route("/bulk/jobs/:id", get(bulk::get_job))
        .route("/bulk/jobs/:id/cancel", post(bulk::cancel_job))
}
