use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use engage_core::{AggregateId, TenantId, VatRate};
use engage_events::EventEnvelope;
use engage_invoicing::{
    InvoiceAccessFacts, InvoiceEvent, InvoiceId, InvoiceItem, InvoiceMetadata, InvoiceNumber,
    InvoiceParty, InvoiceStatus, InvoiceType,
};

use super::cursor::{StreamCursors, decode, ensure_stream};
use super::{Projection, ProjectionError};
use crate::read_model::TenantStore;

pub const INVOICE_AGGREGATE_TYPE: &str = "invoicing.invoice";

pub const DEFAULT_PER_PAGE: usize = 25;

/// Full invoice view (header, parties, items, amounts, lifecycle dates).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceReadModel {
    pub invoice_id: InvoiceId,
    pub invoice_number: InvoiceNumber,
    pub invoice_type: InvoiceType,
    pub issuer: InvoiceParty,
    pub recipient: InvoiceParty,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub currency: String,
    pub vat_rate: VatRate,
    pub items: Vec<InvoiceItem>,
    pub subtotal_htva: i64,
    pub vat_amount: i64,
    pub total_ttc: i64,
    pub amount_paid: i64,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
    pub metadata: InvoiceMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl InvoiceReadModel {
    pub fn recipient_id(&self) -> Option<AggregateId> {
        self.recipient.aggregate_id()
    }

    pub fn access_facts(&self) -> Option<InvoiceAccessFacts> {
        Some(InvoiceAccessFacts {
            invoice_type: self.invoice_type,
            issuer_division: self.issuer.division_id().map(|d| d.0),
            recipient_id: self.recipient_id()?,
        })
    }
}

/// List filter; every field is optional and they combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub recipient_id: Option<AggregateId>,
    /// Keeps invoices whose period starts on or after this date.
    pub billing_period_start: Option<NaiveDate>,
    /// Keeps invoices whose period ends on or before this date.
    pub billing_period_end: Option<NaiveDate>,
}

impl InvoiceFilter {
    pub fn matches(&self, invoice: &InvoiceReadModel) -> bool {
        self.status.is_none_or(|s| invoice.status == s)
            && self.recipient_id.is_none_or(|r| invoice.recipient_id() == Some(r))
            && self.billing_period_start.is_none_or(|d| invoice.billing_period_start >= d)
            && self.billing_period_end.is_none_or(|d| invoice.billing_period_end <= d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub current_page: usize,
    pub last_page: usize,
    pub per_page: usize,
    pub total: usize,
    /// 1-based index of the first row on the page; `None` for an empty page.
    pub from: Option<usize>,
    pub to: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

/// Slice `rows` into 1-based pages. `per_page` of 0 falls back to the default.
pub fn paginate<T>(rows: Vec<T>, per_page: Option<usize>, page: Option<usize>) -> Page<T> {
    let per_page = per_page.filter(|p| *p > 0).unwrap_or(DEFAULT_PER_PAGE);
    let current_page = page.filter(|p| *p > 0).unwrap_or(1);
    let total = rows.len();
    let last_page = total.div_ceil(per_page).max(1);

    let offset = (current_page - 1).saturating_mul(per_page);
    let data: Vec<T> = rows.into_iter().skip(offset).take(per_page).collect();
    let (from, to) = if data.is_empty() { (None, None) } else { (Some(offset + 1), Some(offset + data.len())) };

    Page { data, meta: PageMeta { current_page, last_page, per_page, total, from, to } }
}

#[derive(Debug)]
pub struct InvoicesProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> InvoicesProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    pub fn new(store: S) -> Self {
        Self { store, cursors: StreamCursors::new() }
    }

    pub fn get(&self, tenant_id: TenantId, invoice_id: &InvoiceId) -> Option<InvoiceReadModel> {
        self.store.get(tenant_id, invoice_id)
    }

    /// Filtered, newest first.
    pub fn list(&self, tenant_id: TenantId, filter: &InvoiceFilter) -> Vec<InvoiceReadModel> {
        let mut rows: Vec<_> = self.store.list(tenant_id).into_iter().filter(|i| filter.matches(i)).collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.invoice_number.cmp(&a.invoice_number)));
        rows
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != INVOICE_AGGREGATE_TYPE {
            return Ok(());
        }
        if !self.cursors.admit(envelope)? {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let ev: InvoiceEvent = decode(envelope)?;
        let (event_tenant, invoice_id, at) = match &ev {
            InvoiceEvent::InvoiceIssued(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceUpdated(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceItemAdded(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceItemRemoved(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceConfirmed(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceSent(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoicePaid(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceOverdue(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceCancelled(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
            InvoiceEvent::InvoiceDeleted(e) => (e.tenant_id, e.invoice_id, e.occurred_at),
        };
        ensure_stream(envelope, event_tenant, invoice_id.0)?;

        match ev {
            InvoiceEvent::InvoiceIssued(e) => {
                let confirmed_at = (e.status == InvoiceStatus::Confirmed).then_some(e.occurred_at);
                self.store.upsert(
                    tenant_id,
                    invoice_id,
                    InvoiceReadModel {
                        invoice_id,
                        invoice_number: e.number,
                        invoice_type: e.invoice_type,
                        issuer: e.issuer,
                        recipient: e.recipient,
                        billing_period_start: e.period.start(),
                        billing_period_end: e.period.end(),
                        currency: e.currency,
                        vat_rate: e.vat_rate,
                        items: e.items,
                        subtotal_htva: e.amounts.subtotal,
                        vat_amount: e.amounts.vat_amount,
                        total_ttc: e.amounts.total,
                        amount_paid: 0,
                        status: e.status,
                        due_date: e.due_date,
                        notes: e.notes,
                        metadata: e.metadata,
                        created_at: e.occurred_at,
                        updated_at: e.occurred_at,
                        confirmed_at,
                        sent_at: None,
                        paid_at: None,
                    },
                );
            }
            InvoiceEvent::InvoiceDeleted(_) => {
                self.store.remove(tenant_id, &invoice_id);
            }
            other => {
                let Some(mut rm) = self.store.get(tenant_id, &invoice_id) else {
                    self.cursors.advance(tenant_id, envelope.aggregate_id(), envelope.sequence_number());
                    return Ok(());
                };
                match other {
                    InvoiceEvent::InvoiceUpdated(e) => {
                        rm.notes = e.notes;
                        if let Some(due) = e.due_date {
                            rm.due_date = due;
                        }
                        rm.currency = e.currency;
                    }
                    InvoiceEvent::InvoiceItemAdded(e) => {
                        rm.items.push(e.item);
                        set_amounts(&mut rm, e.amounts);
                    }
                    InvoiceEvent::InvoiceItemRemoved(e) => {
                        rm.items.retain(|i| i.id != e.item_id);
                        set_amounts(&mut rm, e.amounts);
                    }
                    InvoiceEvent::InvoiceConfirmed(e) => {
                        rm.status = InvoiceStatus::Confirmed;
                        rm.confirmed_at = Some(e.occurred_at);
                    }
                    InvoiceEvent::InvoiceSent(e) => {
                        rm.status = InvoiceStatus::Sent;
                        rm.sent_at = Some(e.occurred_at);
                    }
                    InvoiceEvent::InvoicePaid(e) => {
                        rm.status = InvoiceStatus::Paid;
                        rm.amount_paid = e.amount_paid;
                        rm.paid_at = Some(e.occurred_at);
                    }
                    InvoiceEvent::InvoiceOverdue(_) => rm.status = InvoiceStatus::Overdue,
                    InvoiceEvent::InvoiceCancelled(_) => rm.status = InvoiceStatus::Cancelled,
                    InvoiceEvent::InvoiceIssued(_) | InvoiceEvent::InvoiceDeleted(_) => {}
                }
                rm.updated_at = at;
                self.store.upsert(tenant_id, invoice_id, rm);
            }
        }

        self.cursors.advance(tenant_id, envelope.aggregate_id(), envelope.sequence_number());
        Ok(())
    }
}

fn set_amounts(rm: &mut InvoiceReadModel, amounts: engage_invoicing::InvoiceAmounts) {
    rm.subtotal_htva = amounts.subtotal;
    rm.vat_amount = amounts.vat_amount;
    rm.total_ttc = amounts.total;
}

impl<S> Projection for InvoicesProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    fn name(&self) -> &'static str {
        "invoicing.invoices"
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        InvoicesProjection::apply_envelope(self, envelope)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        self.store.clear_tenant(tenant_id);
        self.cursors.clear_tenant(tenant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_meta_matches_slices() {
        let page = paginate((1..=30).collect::<Vec<_>>(), Some(25), Some(2));
        assert_eq!(page.data, (26..=30).collect::<Vec<_>>());
        assert_eq!(
            page.meta,
            PageMeta { current_page: 2, last_page: 2, per_page: 25, total: 30, from: Some(26), to: Some(30) }
        );

        let empty = paginate(Vec::<u8>::new(), None, None);
        assert_eq!(empty.meta.last_page, 1);
        assert_eq!(empty.meta.per_page, DEFAULT_PER_PAGE);
        assert_eq!(empty.meta.from, None);

        let beyond = paginate(vec![1, 2, 3], Some(2), Some(5));
        assert!(beyond.data.is_empty());
        assert_eq!(beyond.meta.total, 3);
    }
}
