use axum::{routing::get, Router};

pub mod common;
pub mod divisions;
pub mod financers;
pub mod invoices;
pub mod invoicing;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/stream", get(system::stream))
        .nest("/divisions", divisions::router())
        .nest("/financers", financers::router())
        .nest("/invoices", invoices::router())
        .nest("/invoicing", invoicing::router())
}
