//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, collaborators, dispatcher and the job lifecycle
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

use sweep_infra::config::AppConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router over already-wired services.
pub fn build_app(services: AppServices, jwt_secret: String) -> Router {
    let jwt = Arc::new(sweep_auth::Hs256JwtValidator::new(jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };
    let services = Arc::new(services);

    // Caller routes: bearer JWT.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // Backend callbacks authenticate per request (signature or shared secret).
    let worker = Router::new()
        .route("/bulk/worker", post(routes::worker::invoke))
        .layer(Extension(services));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .merge(worker)
        .layer(ServiceBuilder::new())
}

/// Build the router from configuration (used by `main.rs`).
pub async fn build_app_from_config(config: AppConfig) -> anyhow::Result<Router> {
    let jwt_secret = config.jwt_secret.clone().unwrap_or_else(|| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let services = services::build_services(&config).await?;
    Ok(build_app(services, jwt_secret))
}
