//! Monthly invoice runs and the job queue behind them.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use engage_auth::permissions::invoices;
use engage_infra::jobs::{JobId, JobStore};
use engage_invoicing::BatchId;
use engage_organizations::DivisionId;

use crate::app::routes::common::CmdAuth;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext};

const DEAD_LETTER_LIMIT: usize = 100;

pub fn router() -> Router {
    Router::new()
        .route("/batches", post(start_monthly_run).get(list_batches))
        .route("/batches/:id", get(get_batch))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/dead-letters", get(list_dead_letters))
        .route("/jobs/dead-letters/:job_id/retry", post(retry_dead_letter))
        .route("/projections/rebuild", post(rebuild_projections))
}

fn require_generate(tenant: &TenantContext, principal: &PrincipalContext) -> Result<(), axum::response::Response> {
    let generate = CmdAuth { inner: (), required: vec![invoices::GENERATE] };
    crate::authz::authorize_command(tenant, principal, &generate).map_err(errors::authz_error_to_response)
}

pub async fn start_monthly_run(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::StartRunRequest>,
) -> axum::response::Response {
    if let Err(resp) = require_generate(&tenant, &principal) {
        return resp;
    }
    let division_id = match dto::parse_opt_id(body.division_id.as_deref(), "division_id") {
        Ok(v) => v.map(DivisionId::new),
        Err(resp) => return resp,
    };

    match services.start_monthly_run(tenant.tenant_id(), &body.month_year, division_id) {
        Ok(summary) => (StatusCode::ACCEPTED, Json(summary)).into_response(),
        Err(e) => errors::monthly_run_error_to_response(e),
    }
}

pub async fn list_batches(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require_generate(&tenant, &principal) {
        return resp;
    }
    let items = services.batches_list(tenant.tenant_id());
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require_generate(&tenant, &principal) {
        return resp;
    }
    let batch_id = match dto::parse_id(&id, "batch id") {
        Ok(v) => BatchId::new(v),
        Err(resp) => return resp,
    };
    match services.batch_get(tenant.tenant_id(), &batch_id) {
        Some(batch) => (StatusCode::OK, Json(batch)).into_response(),
        None => errors::not_found("batch"),
    }
}

pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require_generate(&tenant, &principal) {
        return resp;
    }
    match services.jobs().stats(tenant.tenant_id()) {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::DeadLetterQuery>,
) -> axum::response::Response {
    if let Err(resp) = require_generate(&tenant, &principal) {
        return resp;
    }
    let limit = query.limit.unwrap_or(DEAD_LETTER_LIMIT);
    match services.jobs().list_dead_letters(tenant.tenant_id(), limit) {
        Ok(items) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn retry_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require_generate(&tenant, &principal) {
        return resp;
    }
    let job_id = match dto::parse_id(&job_id, "job id") {
        Ok(v) => JobId::from_uuid(*v.as_uuid()),
        Err(resp) => return resp,
    };
    match services.jobs().retry_dead_letter(tenant.tenant_id(), job_id) {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn rebuild_projections(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require_generate(&tenant, &principal) {
        return resp;
    }
    match services.enqueue_rebuild(tenant.tenant_id()) {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": job_id.to_string(),
                "projections": services.projection_names(),
            })),
        )
            .into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}
