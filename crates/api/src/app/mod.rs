//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: event store/bus, projections, dispatcher and job executor
//! - `routes/`: HTTP routes + handlers (one file per domain area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::config::ApiConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// The services are returned as well so the caller can stop their background
/// workers on shutdown.
pub async fn build_app(config: &ApiConfig) -> Result<(Router, Arc<services::AppServices>), services::ServicesError> {
    let jwt = Arc::new(engage_auth::Hs256JwtValidator::new(config.jwt_secret.as_bytes()));
    let auth_state = middleware::AuthState { jwt };

    let services = Arc::new(services::build_services(config).await?);

    // Protected routes: require auth + tenant context.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(auth_state, middleware::auth_middleware));

    let router = Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new());

    Ok((router, services))
}
