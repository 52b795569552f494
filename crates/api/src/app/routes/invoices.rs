use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{Datelike, Utc};

use engage_core::TenantId;
use engage_infra::projections::{invoices::INVOICE_AGGREGATE_TYPE, paginate};
use engage_invoicing::{
    AddInvoiceItem, BillingPeriod, CancelInvoice, ConfirmInvoice, DeleteDraftInvoice, Invoice,
    InvoiceAccessFacts, InvoiceCommand, InvoiceId, InvoiceItemId, InvoiceMetadata, InvoiceParty,
    InvoiceStatus, InvoiceType, IssueInvoice, MarkInvoicePaid, MarkInvoiceSent, RemoveInvoiceItem,
    UpdateInvoice, policy,
};
use engage_organizations::{DivisionId, FinancerId};

use crate::app::routes::common::{invoice_aggregate, invoice_facts};
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext};

const DEFAULT_CURRENCY: &str = "EUR";

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_invoice).get(list_invoices))
        .route("/bulk/status", post(bulk_update_status))
        .route("/:id", get(get_invoice).put(update_invoice).delete(delete_invoice))
        .route("/:id/confirm", post(confirm_invoice))
        .route("/:id/mark-sent", post(mark_invoice_sent))
        .route("/:id/mark-paid", post(mark_invoice_paid))
        .route("/:id/items", post(add_invoice_item))
        .route("/:id/items/:item_id", delete(remove_invoice_item))
}

fn parse_invoice_id(raw: &str) -> Result<InvoiceId, axum::response::Response> {
    dto::parse_id(raw, "invoice id").map(InvoiceId::new)
}

pub async fn create_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateInvoiceRequest>,
) -> axum::response::Response {
    let tenant_id = tenant.tenant_id();
    let recipient_agg = match dto::parse_id(&body.recipient_id, "recipient_id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // The recipient decides the invoice type and who issues it.
    let (invoice_type, issuer, recipient, division_id) = match body.recipient_type.as_str() {
        "division" => {
            let division_id = DivisionId::new(recipient_agg);
            if services.division_get(tenant_id, &division_id).is_none() {
                return errors::not_found("division");
            }
            (InvoiceType::HexekoToDivision, InvoiceParty::Hexeko, InvoiceParty::Division(division_id), division_id)
        }
        "financer" => {
            let financer_id = FinancerId::new(recipient_agg);
            let Some(financer) = services.financer_get(tenant_id, &financer_id) else {
                return errors::not_found("financer");
            };
            let Some(division_id) = financer.division_id else {
                return errors::json_error(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "invariant_violation",
                    "financer is not attached to a division",
                );
            };
            (
                InvoiceType::DivisionToFinancer,
                InvoiceParty::Division(division_id),
                InvoiceParty::Financer(financer_id),
                division_id,
            )
        }
        _ => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "recipient_type must be 'division' or 'financer'",
            );
        }
    };

    if let Err(e) = policy::create(&principal.principal(&tenant), invoice_type) {
        return errors::authz_error_to_response(e);
    }

    let period = match BillingPeriod::new(body.billing_period_start, body.billing_period_end) {
        Ok(p) => p,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let mut items = Vec::with_capacity(body.items.len());
    for item in body.items {
        match item.into_new_item() {
            Ok(i) => items.push(i),
            Err(resp) => return resp,
        }
    }

    let currency = body
        .currency
        .or_else(|| services.division_get(tenant_id, &division_id).map(|d| d.currency))
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let number = match services.allocate_number(tenant_id, invoice_type, period.start().year()) {
        Ok(n) => n,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let invoice_id = InvoiceId::generate();
    let cmd = InvoiceCommand::IssueInvoice(IssueInvoice {
        tenant_id,
        invoice_id,
        number,
        invoice_type,
        issuer,
        recipient,
        metadata: InvoiceMetadata {
            month_year: Some(period.month_year()),
            division_id: Some(division_id),
            batch_id: None,
        },
        period,
        currency,
        vat_rate: body.vat_rate,
        items,
        due_date: body.due_date,
        notes: body.notes,
        status: InvoiceStatus::Draft,
        occurred_at: Utc::now(),
    });

    if let Err(e) = services.dispatch::<Invoice>(tenant_id, INVOICE_AGGREGATE_TYPE, cmd, invoice_aggregate) {
        return errors::dispatch_error_to_response(e);
    }

    match services.invoices_get(tenant_id, &invoice_id) {
        Some(rm) => (StatusCode::CREATED, Json(dto::invoice_to_json(rm))).into_response(),
        None => (StatusCode::CREATED, Json(serde_json::json!({"id": invoice_id.to_string()}))).into_response(),
    }
}

pub async fn list_invoices(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::ListInvoicesQuery>,
) -> axum::response::Response {
    let principal = principal.principal(&tenant);
    if let Err(e) = policy::view_any(&principal) {
        return errors::authz_error_to_response(e);
    }
    let filter = match query.filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    let visible: Vec<_> = services
        .invoices_list(tenant.tenant_id(), &filter)
        .into_iter()
        .filter(|rm| rm.access_facts().is_some_and(|facts| policy::view(&principal, &facts).is_ok()))
        .collect();

    (StatusCode::OK, Json(paginate(visible, query.per_page, query.page))).into_response()
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(rm) = services.invoices_get(tenant.tenant_id(), &invoice_id) else {
        return errors::not_found("invoice");
    };
    let Some(facts) = rm.access_facts() else {
        return errors::not_found("invoice");
    };
    if let Err(e) = policy::view(&principal.principal(&tenant), &facts) {
        return errors::authz_error_to_response(e);
    }
    (StatusCode::OK, Json(dto::invoice_to_json(rm))).into_response()
}

pub async fn update_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateInvoiceRequest>,
) -> axum::response::Response {
    guarded(&services, &tenant, &principal, &id, policy::update, |tenant_id, invoice_id| {
        InvoiceCommand::UpdateInvoice(UpdateInvoice {
            tenant_id,
            invoice_id,
            notes: body.notes,
            due_date: body.due_date,
            currency: body.currency,
            occurred_at: Utc::now(),
        })
    })
}

pub async fn delete_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let tenant_id = tenant.tenant_id();
    let facts = match invoice_facts(&services, tenant_id, invoice_id) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    if let Err(e) = policy::delete(&principal.principal(&tenant), &facts) {
        return errors::authz_error_to_response(e);
    }

    let cmd = InvoiceCommand::DeleteDraftInvoice(DeleteDraftInvoice { tenant_id, invoice_id, occurred_at: Utc::now() });
    match services.dispatch::<Invoice>(tenant_id, INVOICE_AGGREGATE_TYPE, cmd, invoice_aggregate) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn confirm_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    guarded(&services, &tenant, &principal, &id, policy::confirm, |tenant_id, invoice_id| {
        InvoiceCommand::ConfirmInvoice(ConfirmInvoice { tenant_id, invoice_id, occurred_at: Utc::now() })
    })
}

pub async fn mark_invoice_sent(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    guarded(&services, &tenant, &principal, &id, policy::mark_sent, |tenant_id, invoice_id| {
        InvoiceCommand::MarkInvoiceSent(MarkInvoiceSent { tenant_id, invoice_id, occurred_at: Utc::now() })
    })
}

pub async fn mark_invoice_paid(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::MarkPaidRequest>>,
) -> axum::response::Response {
    let amount = body.and_then(|Json(b)| b.amount_paid);
    let invoice_id = match parse_invoice_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let tenant_id = tenant.tenant_id();
    let facts = match invoice_facts(&services, tenant_id, invoice_id) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    if let Err(e) = policy::mark_paid(&principal.principal(&tenant), &facts) {
        return errors::authz_error_to_response(e);
    }
    if let Err(resp) = pay(&services, tenant_id, invoice_id, amount) {
        return resp;
    }
    respond_invoice(&services, tenant_id, invoice_id)
}

pub async fn add_invoice_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::InvoiceItemRequest>,
) -> axum::response::Response {
    let item = match body.into_new_item() {
        Ok(i) => i,
        Err(resp) => return resp,
    };
    guarded(&services, &tenant, &principal, &id, policy::manage_items, |tenant_id, invoice_id| {
        InvoiceCommand::AddInvoiceItem(AddInvoiceItem { tenant_id, invoice_id, item, occurred_at: Utc::now() })
    })
}

pub async fn remove_invoice_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, item_id)): Path<(String, String)>,
) -> axum::response::Response {
    let item_id = match dto::parse_id(&item_id, "item id") {
        Ok(v) => InvoiceItemId(v),
        Err(resp) => return resp,
    };
    guarded(&services, &tenant, &principal, &id, policy::manage_items, |tenant_id, invoice_id| {
        InvoiceCommand::RemoveInvoiceItem(RemoveInvoiceItem { tenant_id, invoice_id, item_id, occurred_at: Utc::now() })
    })
}

/// Apply one status to many invoices. Authorization is all-or-nothing; the
/// transitions themselves succeed or fail per invoice.
pub async fn bulk_update_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::BulkStatusRequest>,
) -> axum::response::Response {
    let tenant_id = tenant.tenant_id();
    let target = match dto::parse_status(&body.status) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let mut invoice_ids = Vec::with_capacity(body.invoice_ids.len());
    for raw in &body.invoice_ids {
        match parse_invoice_id(raw) {
            Ok(id) => invoice_ids.push(id),
            Err(resp) => return resp,
        }
    }

    let facts: Vec<Option<InvoiceAccessFacts>> = invoice_ids
        .iter()
        .map(|id| invoice_facts(&services, tenant_id, *id).ok())
        .collect();
    if let Err(e) = policy::bulk_update_status(&principal.principal(&tenant), target, &facts) {
        return errors::authz_error_to_response(e);
    }

    let mut result = dto::BulkStatusResult { updated: Vec::new(), failed: Vec::new() };
    for invoice_id in invoice_ids {
        match transition(&services, tenant_id, invoice_id, target) {
            Ok(()) => result.updated.push(invoice_id.to_string()),
            Err(error) => {
                tracing::debug!(%invoice_id, %error, "bulk status change skipped invoice");
                result.failed.push(dto::BulkFailure { invoice_id: invoice_id.to_string(), error });
            }
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "message": "Invoices status updated", "data": result })),
    )
        .into_response()
}

fn transition(services: &AppServices, tenant_id: TenantId, invoice_id: InvoiceId, target: InvoiceStatus) -> Result<(), String> {
    let occurred_at = Utc::now();
    let cmd = match target {
        InvoiceStatus::Confirmed => InvoiceCommand::ConfirmInvoice(ConfirmInvoice { tenant_id, invoice_id, occurred_at }),
        InvoiceStatus::Sent => InvoiceCommand::MarkInvoiceSent(MarkInvoiceSent { tenant_id, invoice_id, occurred_at }),
        InvoiceStatus::Cancelled => {
            InvoiceCommand::CancelInvoice(CancelInvoice { tenant_id, invoice_id, reason: None, occurred_at })
        }
        InvoiceStatus::Paid => {
            return pay(services, tenant_id, invoice_id, None).map_err(|_| "payment could not be recorded".to_string());
        }
        other => return Err(format!("cannot transition to '{}'", other.as_str())),
    };
    services
        .dispatch::<Invoice>(tenant_id, INVOICE_AGGREGATE_TYPE, cmd, invoice_aggregate)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Mark the invoice paid, then book the payment on the balances it feeds.
fn pay(
    services: &AppServices,
    tenant_id: TenantId,
    invoice_id: InvoiceId,
    amount: Option<i64>,
) -> Result<(), axum::response::Response> {
    let cmd = InvoiceCommand::MarkInvoicePaid(MarkInvoicePaid { tenant_id, invoice_id, amount, occurred_at: Utc::now() });
    services
        .dispatch::<Invoice>(tenant_id, INVOICE_AGGREGATE_TYPE, cmd, invoice_aggregate)
        .map_err(errors::dispatch_error_to_response)?;

    let invoice = services
        .load::<Invoice>(tenant_id, invoice_id.0, invoice_aggregate)
        .map_err(errors::dispatch_error_to_response)?
        .ok_or_else(|| errors::not_found("invoice"))?;
    services
        .record_payment(tenant_id, &invoice, invoice.amount_paid())
        .map(|_| ())
        .map_err(errors::job_store_error_to_response)
}

/// Load facts, run `check`, dispatch the command built by `build`, and answer
/// with the updated invoice.
fn guarded(
    services: &AppServices,
    tenant: &TenantContext,
    principal: &PrincipalContext,
    raw_id: &str,
    check: fn(&engage_auth::Principal, &InvoiceAccessFacts) -> Result<(), engage_auth::AuthzError>,
    build: impl FnOnce(TenantId, InvoiceId) -> InvoiceCommand,
) -> axum::response::Response {
    let invoice_id = match parse_invoice_id(raw_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let tenant_id = tenant.tenant_id();
    let facts = match invoice_facts(services, tenant_id, invoice_id) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    if let Err(e) = check(&principal.principal(tenant), &facts) {
        return errors::authz_error_to_response(e);
    }

    match services.dispatch::<Invoice>(tenant_id, INVOICE_AGGREGATE_TYPE, build(tenant_id, invoice_id), invoice_aggregate) {
        Ok(_) => respond_invoice(services, tenant_id, invoice_id),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

fn respond_invoice(services: &AppServices, tenant_id: TenantId, invoice_id: InvoiceId) -> axum::response::Response {
    match services.invoices_get(tenant_id, &invoice_id) {
        Some(rm) => (StatusCode::OK, Json(dto::invoice_to_json(rm))).into_response(),
        None => errors::not_found("invoice"),
    }
}
