use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;

use engage_auth::permissions::organizations;
use engage_core::{AggregateId, TenantId};
use engage_infra::projections::organizations::DIVISION_AGGREGATE_TYPE;
use engage_invoicing::policy;
use engage_organizations::{
    CreateDivision, Division, DivisionCommand, DivisionId, ModuleId, SetDivisionModulePrice,
    UpdateDivisionPricing,
};

use crate::app::routes::common::CmdAuth;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_division).get(list_divisions))
        .route("/:id", get(get_division))
        .route("/:id/pricing", put(update_pricing))
        .route("/:id/modules/:module_id", put(set_module_price))
        .route("/:id/balance", get(get_balance))
}

fn division_aggregate(_tenant_id: TenantId, aggregate_id: AggregateId) -> Division {
    Division::empty(DivisionId::new(aggregate_id))
}

pub async fn create_division(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateDivisionRequest>,
) -> axum::response::Response {
    let division_id = DivisionId::generate();
    let cmd = DivisionCommand::CreateDivision(CreateDivision {
        tenant_id: tenant.tenant_id(),
        division_id,
        name: body.name,
        country: body.country,
        currency: body.currency,
        vat_rate: body.vat_rate,
        core_package_price: body.core_package_price,
        contract_start_date: body.contract_start_date,
        occurred_at: Utc::now(),
    });

    match dispatch_division(&services, &tenant, &principal, cmd) {
        Ok(committed) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"id": division_id.to_string(), "events_committed": committed})),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

pub async fn update_pricing(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateDivisionPricingRequest>,
) -> axum::response::Response {
    let division_id = match dto::parse_id(&id, "division id") {
        Ok(v) => DivisionId::new(v),
        Err(resp) => return resp,
    };
    let cmd = DivisionCommand::UpdateDivisionPricing(UpdateDivisionPricing {
        tenant_id: tenant.tenant_id(),
        division_id,
        core_package_price: body.core_package_price,
        vat_rate: body.vat_rate,
        contract_start_date: body.contract_start_date,
        occurred_at: Utc::now(),
    });

    match dispatch_division(&services, &tenant, &principal, cmd) {
        Ok(_) => respond_division(&services, &tenant, division_id),
        Err(resp) => resp,
    }
}

pub async fn set_module_price(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, module_id)): Path<(String, String)>,
    Json(body): Json<dto::SetModulePriceRequest>,
) -> axum::response::Response {
    let division_id = match dto::parse_id(&id, "division id") {
        Ok(v) => DivisionId::new(v),
        Err(resp) => return resp,
    };
    let module_id = match dto::parse_id(&module_id, "module id") {
        Ok(v) => ModuleId::new(v),
        Err(resp) => return resp,
    };
    let cmd = DivisionCommand::SetDivisionModulePrice(SetDivisionModulePrice {
        tenant_id: tenant.tenant_id(),
        division_id,
        module_id,
        price: body.price,
        occurred_at: Utc::now(),
    });

    match dispatch_division(&services, &tenant, &principal, cmd) {
        Ok(_) => respond_division(&services, &tenant, division_id),
        Err(resp) => resp,
    }
}

pub async fn get_division(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require_read(&tenant, &principal) {
        return resp;
    }
    let division_id = match dto::parse_id(&id, "division id") {
        Ok(v) => DivisionId::new(v),
        Err(resp) => return resp,
    };
    respond_division(&services, &tenant, division_id)
}

pub async fn list_divisions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require_read(&tenant, &principal) {
        return resp;
    }
    let items = services.divisions_list(tenant.tenant_id());
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg = match dto::parse_id(&id, "division id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(e) = policy::view_division_balance(&principal.principal(&tenant), agg) {
        return errors::authz_error_to_response(e);
    }
    match services.division_balance(tenant.tenant_id(), &DivisionId::new(agg)) {
        Some(balance) => (StatusCode::OK, Json(balance)).into_response(),
        None => errors::not_found("division balance"),
    }
}

fn require_read(tenant: &TenantContext, principal: &PrincipalContext) -> Result<(), axum::response::Response> {
    let read = CmdAuth { inner: (), required: vec![organizations::READ] };
    crate::authz::authorize_command(tenant, principal, &read).map_err(errors::authz_error_to_response)
}

fn dispatch_division(
    services: &AppServices,
    tenant: &TenantContext,
    principal: &PrincipalContext,
    cmd: DivisionCommand,
) -> Result<usize, axum::response::Response> {
    let cmd_auth = CmdAuth { inner: cmd, required: vec![organizations::MANAGE] };
    crate::authz::authorize_command(tenant, principal, &cmd_auth).map_err(errors::authz_error_to_response)?;

    services
        .dispatch::<Division>(tenant.tenant_id(), DIVISION_AGGREGATE_TYPE, cmd_auth.inner, division_aggregate)
        .map(|committed| committed.len())
        .map_err(errors::dispatch_error_to_response)
}

fn respond_division(services: &AppServices, tenant: &TenantContext, division_id: DivisionId) -> axum::response::Response {
    match services.division_get(tenant.tenant_id(), &division_id) {
        Some(division) => (StatusCode::OK, Json(division)).into_response(),
        None => errors::not_found("division"),
    }
}
