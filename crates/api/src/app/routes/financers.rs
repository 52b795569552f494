use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;

use engage_auth::permissions::organizations;
use engage_core::{AggregateId, TenantId, UserId};
use engage_infra::projections::organizations::FINANCER_AGGREGATE_TYPE;
use engage_invoicing::{BillingPeriod, policy, prorata};
use engage_organizations::{
    ActivateModule, DeactivateModule, DivisionId, EnrollBeneficiary, Financer, FinancerCommand,
    FinancerId, ModuleId, OffboardBeneficiary, RegisterFinancer, UpdateFinancerContract,
};

use crate::app::routes::common::CmdAuth;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", post(register_financer).get(list_financers))
        .route("/:id", get(get_financer))
        .route("/:id/contract", put(update_contract))
        .route("/:id/modules/:module_id/activate", post(activate_module))
        .route("/:id/modules/:module_id/deactivate", post(deactivate_module))
        .route("/:id/beneficiaries", post(enroll_beneficiary))
        .route("/:id/beneficiaries/prorata", get(beneficiary_prorata))
        .route("/:id/beneficiaries/:user_id/offboard", post(offboard_beneficiary))
        .route("/:id/balance", get(get_balance))
}

fn financer_aggregate(_tenant_id: TenantId, aggregate_id: AggregateId) -> Financer {
    Financer::empty(FinancerId::new(aggregate_id))
}

fn parse_financer_id(raw: &str) -> Result<FinancerId, axum::response::Response> {
    dto::parse_id(raw, "financer id").map(FinancerId::new)
}

pub async fn register_financer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::RegisterFinancerRequest>,
) -> axum::response::Response {
    let division_id = match dto::parse_opt_id(body.division_id.as_deref(), "division_id") {
        Ok(v) => v.map(DivisionId::new),
        Err(resp) => return resp,
    };
    if division_id.is_some_and(|d| services.division_get(tenant.tenant_id(), &d).is_none()) {
        return errors::not_found("division");
    }

    let financer_id = FinancerId::generate();
    let cmd = FinancerCommand::RegisterFinancer(RegisterFinancer {
        tenant_id: tenant.tenant_id(),
        financer_id,
        name: body.name,
        division_id,
        contract_start_date: body.contract_start_date,
        core_package_price: body.core_package_price,
        occurred_at: Utc::now(),
    });

    match dispatch_financer(&services, &tenant, &principal, cmd) {
        Ok(committed) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"id": financer_id.to_string(), "events_committed": committed})),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

pub async fn update_contract(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateFinancerContractRequest>,
) -> axum::response::Response {
    let financer_id = match parse_financer_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = FinancerCommand::UpdateFinancerContract(UpdateFinancerContract {
        tenant_id: tenant.tenant_id(),
        financer_id,
        contract_start_date: body.contract_start_date,
        core_package_price: body.core_package_price,
        occurred_at: Utc::now(),
    });

    match dispatch_financer(&services, &tenant, &principal, cmd) {
        Ok(_) => respond_financer(&services, &tenant, financer_id),
        Err(resp) => resp,
    }
}

pub async fn activate_module(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, module_id)): Path<(String, String)>,
    body: Option<Json<dto::ToggleModuleRequest>>,
) -> axum::response::Response {
    let (financer_id, module_id) = match parse_module_path(&id, &module_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let now = Utc::now();
    let cmd = FinancerCommand::ActivateModule(ActivateModule {
        tenant_id: tenant.tenant_id(),
        financer_id,
        module_id,
        price_per_beneficiary: body.price_per_beneficiary,
        on: body.on.unwrap_or_else(|| now.date_naive()),
        occurred_at: now,
    });

    match dispatch_financer(&services, &tenant, &principal, cmd) {
        Ok(_) => respond_financer(&services, &tenant, financer_id),
        Err(resp) => resp,
    }
}

pub async fn deactivate_module(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, module_id)): Path<(String, String)>,
    body: Option<Json<dto::ToggleModuleRequest>>,
) -> axum::response::Response {
    let (financer_id, module_id) = match parse_module_path(&id, &module_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let now = Utc::now();
    let cmd = FinancerCommand::DeactivateModule(DeactivateModule {
        tenant_id: tenant.tenant_id(),
        financer_id,
        module_id,
        on: body.on.unwrap_or_else(|| now.date_naive()),
        occurred_at: now,
    });

    match dispatch_financer(&services, &tenant, &principal, cmd) {
        Ok(_) => respond_financer(&services, &tenant, financer_id),
        Err(resp) => resp,
    }
}

pub async fn enroll_beneficiary(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::EnrollBeneficiaryRequest>,
) -> axum::response::Response {
    let financer_id = match parse_financer_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let user_id: UserId = match body.user_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::invalid_id("user_id"),
    };
    let cmd = FinancerCommand::EnrollBeneficiary(EnrollBeneficiary {
        tenant_id: tenant.tenant_id(),
        financer_id,
        user_id,
        from: body.from,
        occurred_at: Utc::now(),
    });

    match dispatch_financer(&services, &tenant, &principal, cmd) {
        Ok(committed) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "financer_id": financer_id.to_string(),
                "user_id": user_id.to_string(),
                "events_committed": committed,
            })),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

pub async fn offboard_beneficiary(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, user_id)): Path<(String, String)>,
    Json(body): Json<dto::OffboardBeneficiaryRequest>,
) -> axum::response::Response {
    let financer_id = match parse_financer_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let user_id: UserId = match user_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::invalid_id("user id"),
    };
    let cmd = FinancerCommand::OffboardBeneficiary(OffboardBeneficiary {
        tenant_id: tenant.tenant_id(),
        financer_id,
        user_id,
        to: body.to,
        occurred_at: Utc::now(),
    });

    match dispatch_financer(&services, &tenant, &principal, cmd) {
        Ok(_) => respond_financer(&services, &tenant, financer_id),
        Err(resp) => resp,
    }
}

pub async fn get_financer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require_read(&tenant, &principal) {
        return resp;
    }
    match parse_financer_id(&id) {
        Ok(financer_id) => respond_financer(&services, &tenant, financer_id),
        Err(resp) => resp,
    }
}

pub async fn list_financers(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require_read(&tenant, &principal) {
        return resp;
    }
    let items = services.financers_list(tenant.tenant_id());
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

/// Share of the month each beneficiary was enrolled for.
pub async fn beneficiary_prorata(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(query): Query<dto::MonthQuery>,
) -> axum::response::Response {
    if let Err(resp) = require_read(&tenant, &principal) {
        return resp;
    }
    let financer_id = match parse_financer_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let period = match BillingPeriod::from_month_year(&query.month) {
        Ok(p) => p,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let Some(financer) = services.financer_get(tenant.tenant_id(), &financer_id) else {
        return errors::not_found("financer");
    };

    let shares = prorata::beneficiary_prorata(financer.beneficiaries.values(), &period);
    let body = dto::ProrataResponse::new(period.month_year(), period.total_days(), shares);
    (StatusCode::OK, Json(body)).into_response()
}

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let financer_id = match parse_financer_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let division_id = services
        .financer_get(tenant.tenant_id(), &financer_id)
        .and_then(|f| f.division_id)
        .map(|d| d.0);
    if let Err(e) = policy::view_financer_balance(&principal.principal(&tenant), financer_id.0, division_id) {
        return errors::authz_error_to_response(e);
    }
    match services.credit_balance(tenant.tenant_id(), &financer_id) {
        Some(balance) => (StatusCode::OK, Json(balance)).into_response(),
        None => errors::not_found("credit balance"),
    }
}

fn parse_module_path(id: &str, module_id: &str) -> Result<(FinancerId, ModuleId), axum::response::Response> {
    let financer_id = parse_financer_id(id)?;
    let module_id = dto::parse_id(module_id, "module id").map(ModuleId::new)?;
    Ok((financer_id, module_id))
}

fn require_read(tenant: &TenantContext, principal: &PrincipalContext) -> Result<(), axum::response::Response> {
    let read = CmdAuth { inner: (), required: vec![organizations::READ] };
    crate::authz::authorize_command(tenant, principal, &read).map_err(errors::authz_error_to_response)
}

fn dispatch_financer(
    services: &AppServices,
    tenant: &TenantContext,
    principal: &PrincipalContext,
    cmd: FinancerCommand,
) -> Result<usize, axum::response::Response> {
    let cmd_auth = CmdAuth { inner: cmd, required: vec![organizations::MANAGE] };
    crate::authz::authorize_command(tenant, principal, &cmd_auth).map_err(errors::authz_error_to_response)?;

    services
        .dispatch::<Financer>(tenant.tenant_id(), FINANCER_AGGREGATE_TYPE, cmd_auth.inner, financer_aggregate)
        .map(|committed| committed.len())
        .map_err(errors::dispatch_error_to_response)
}

fn respond_financer(services: &AppServices, tenant: &TenantContext, financer_id: FinancerId) -> axum::response::Response {
    match services.financer_get(tenant.tenant_id(), &financer_id) {
        Some(financer) => (StatusCode::OK, Json(financer)).into_response(),
        None => errors::not_found("financer"),
    }
}
