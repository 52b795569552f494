use engage_auth::{CommandAuthorization, Permission};
use engage_core::{AggregateId, TenantId};
use engage_invoicing::{Invoice, InvoiceAccessFacts, InvoiceId};

use crate::app::{errors, services::AppServices};

/// Small helper wrapper to associate required permissions with a command.
pub struct CmdAuth<C> {
    pub inner: C,
    pub required: Vec<Permission>,
}

impl<C> CommandAuthorization for CmdAuth<C> {
    fn required_permissions(&self) -> &[Permission] {
        &self.required
    }
}

pub fn invoice_aggregate(_tenant_id: TenantId, aggregate_id: AggregateId) -> Invoice {
    Invoice::empty(InvoiceId::new(aggregate_id))
}

/// Policy facts for an invoice, read from its stream so that a request never
/// acts on a stale projection.
pub fn invoice_facts(
    services: &AppServices,
    tenant_id: TenantId,
    invoice_id: InvoiceId,
) -> Result<InvoiceAccessFacts, axum::response::Response> {
    let invoice = services
        .load::<Invoice>(tenant_id, invoice_id.0, invoice_aggregate)
        .map_err(errors::dispatch_error_to_response)?;
    invoice
        .as_ref()
        .and_then(InvoiceAccessFacts::of)
        .ok_or_else(|| errors::not_found("invoice"))
}
