//! Outstanding balances per division and per financer.
//!
//! Both read models are fed by the balance ledger streams; `balance` is
//! always `invoiced_total - paid_total`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use engage_core::{AggregateId, TenantId};
use engage_events::EventEnvelope;
use engage_invoicing::{DivisionBalance, DivisionBalanceEvent, FinancerBalance, FinancerBalanceEvent};
use engage_organizations::{DivisionId, FinancerId};

use super::cursor::{StreamCursors, decode, ensure_stream};
use super::{Projection, ProjectionError};
use crate::read_model::TenantStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceReadModel {
    pub owner_id: AggregateId,
    pub balance: i64,
    pub invoiced_total: i64,
    pub paid_total: i64,
    pub invoice_count: u32,
    pub last_invoice_at: Option<DateTime<Utc>>,
}

impl BalanceReadModel {
    fn empty(owner_id: AggregateId) -> Self {
        Self { owner_id, balance: 0, invoiced_total: 0, paid_total: 0, invoice_count: 0, last_invoice_at: None }
    }

    fn invoiced(&mut self, amount: i64, at: DateTime<Utc>) {
        self.invoiced_total += amount;
        self.invoice_count += 1;
        self.last_invoice_at = Some(self.last_invoice_at.map_or(at, |last| last.max(at)));
        self.balance = self.invoiced_total - self.paid_total;
    }

    fn paid(&mut self, amount: i64) {
        self.paid_total += amount;
        self.balance = self.invoiced_total - self.paid_total;
    }
}

fn upsert_with<K, S>(store: &S, tenant_id: TenantId, key: K, owner_id: AggregateId, f: impl FnOnce(&mut BalanceReadModel))
where
    S: TenantStore<K, BalanceReadModel>,
{
    let mut rm = store.get(tenant_id, &key).unwrap_or_else(|| BalanceReadModel::empty(owner_id));
    f(&mut rm);
    store.upsert(tenant_id, key, rm);
}

/// What each division owes the platform.
#[derive(Debug)]
pub struct DivisionBalancesProjection<S>
where
    S: TenantStore<DivisionId, BalanceReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> DivisionBalancesProjection<S>
where
    S: TenantStore<DivisionId, BalanceReadModel>,
{
    pub fn new(store: S) -> Self {
        Self { store, cursors: StreamCursors::new() }
    }

    pub fn get(&self, tenant_id: TenantId, division_id: &DivisionId) -> Option<BalanceReadModel> {
        self.store.get(tenant_id, division_id)
    }

    pub fn list(&self, tenant_id: TenantId) -> Vec<BalanceReadModel> {
        let mut rows = self.store.list(tenant_id);
        rows.sort_by_key(|r| r.owner_id);
        rows
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != DivisionBalance::AGGREGATE_TYPE {
            return Ok(());
        }
        if !self.cursors.admit(envelope)? {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        match decode::<DivisionBalanceEvent>(envelope)? {
            DivisionBalanceEvent::DivisionInvoiceGenerated(e) => {
                ensure_stream(envelope, e.tenant_id, DivisionBalance::stream_id(e.division_id))?;
                upsert_with(&self.store, tenant_id, e.division_id, e.division_id.0, |rm| {
                    rm.invoiced(e.amount, e.occurred_at)
                });
            }
            DivisionBalanceEvent::DivisionInvoicePaid(e) => {
                ensure_stream(envelope, e.tenant_id, DivisionBalance::stream_id(e.division_id))?;
                upsert_with(&self.store, tenant_id, e.division_id, e.division_id.0, |rm| rm.paid(e.amount));
            }
        }

        self.cursors.advance(tenant_id, envelope.aggregate_id(), envelope.sequence_number());
        Ok(())
    }
}

impl<S> Projection for DivisionBalancesProjection<S>
where
    S: TenantStore<DivisionId, BalanceReadModel>,
{
    fn name(&self) -> &'static str {
        "invoicing.division_balances"
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        DivisionBalancesProjection::apply_envelope(self, envelope)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        self.store.clear_tenant(tenant_id);
        self.cursors.clear_tenant(tenant_id);
    }
}

/// What each financer owes its division.
#[derive(Debug)]
pub struct CreditBalancesProjection<S>
where
    S: TenantStore<FinancerId, BalanceReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> CreditBalancesProjection<S>
where
    S: TenantStore<FinancerId, BalanceReadModel>,
{
    pub fn new(store: S) -> Self {
        Self { store, cursors: StreamCursors::new() }
    }

    pub fn get(&self, tenant_id: TenantId, financer_id: &FinancerId) -> Option<BalanceReadModel> {
        self.store.get(tenant_id, financer_id)
    }

    pub fn list(&self, tenant_id: TenantId) -> Vec<BalanceReadModel> {
        let mut rows = self.store.list(tenant_id);
        rows.sort_by_key(|r| r.owner_id);
        rows
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != FinancerBalance::AGGREGATE_TYPE {
            return Ok(());
        }
        if !self.cursors.admit(envelope)? {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        match decode::<FinancerBalanceEvent>(envelope)? {
            FinancerBalanceEvent::FinancerInvoiceGenerated(e) => {
                ensure_stream(envelope, e.tenant_id, FinancerBalance::stream_id(e.financer_id))?;
                upsert_with(&self.store, tenant_id, e.financer_id, e.financer_id.0, |rm| {
                    rm.invoiced(e.amount, e.occurred_at)
                });
            }
            FinancerBalanceEvent::FinancerInvoicePaid(e) => {
                ensure_stream(envelope, e.tenant_id, FinancerBalance::stream_id(e.financer_id))?;
                upsert_with(&self.store, tenant_id, e.financer_id, e.financer_id.0, |rm| rm.paid(e.amount));
            }
        }

        self.cursors.advance(tenant_id, envelope.aggregate_id(), envelope.sequence_number());
        Ok(())
    }
}

impl<S> Projection for CreditBalancesProjection<S>
where
    S: TenantStore<FinancerId, BalanceReadModel>,
{
    fn name(&self) -> &'static str {
        "invoicing.credit_balances"
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        CreditBalancesProjection::apply_envelope(self, envelope)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        self.store.clear_tenant(tenant_id);
        self.cursors.clear_tenant(tenant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use engage_invoicing::{FinancerInvoiceGenerated, FinancerInvoicePaid, InvoiceId};
    use uuid::Uuid;

    use crate::read_model::InMemoryTenantStore;

    fn envelope(tenant_id: TenantId, financer_id: FinancerId, seq: u64, ev: FinancerBalanceEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            FinancerBalance::stream_id(financer_id),
            FinancerBalance::AGGREGATE_TYPE,
            seq,
            serde_json::to_value(ev).unwrap(),
        )
    }

    #[test]
    fn balance_is_invoiced_minus_paid() {
        let tenant_id = TenantId::new();
        let financer_id = FinancerId::generate();
        let invoice_id = InvoiceId::generate();
        let now = Utc::now();

        let p = CreditBalancesProjection::new(Arc::new(InMemoryTenantStore::new()));
        let generated = envelope(
            tenant_id,
            financer_id,
            1,
            FinancerBalanceEvent::FinancerInvoiceGenerated(FinancerInvoiceGenerated {
                tenant_id,
                financer_id,
                invoice_id,
                amount: 12_000,
                occurred_at: now,
            }),
        );
        let paid = envelope(
            tenant_id,
            financer_id,
            2,
            FinancerBalanceEvent::FinancerInvoicePaid(FinancerInvoicePaid {
                tenant_id,
                financer_id,
                invoice_id,
                amount: 5_000,
                occurred_at: now,
            }),
        );

        p.apply_envelope(&generated).unwrap();
        p.apply_envelope(&paid).unwrap();
        p.apply_envelope(&paid).unwrap();

        let rm = p.get(tenant_id, &financer_id).unwrap();
        assert_eq!(rm.invoiced_total, 12_000);
        assert_eq!(rm.paid_total, 5_000);
        assert_eq!(rm.balance, 7_000);
        assert_eq!(rm.invoice_count, 1);
        assert_eq!(rm.last_invoice_at, Some(now));
    }

    #[test]
    fn event_for_a_different_stream_is_rejected() {
        let tenant_id = TenantId::new();
        let financer_id = FinancerId::generate();
        let mut env = envelope(
            tenant_id,
            financer_id,
            1,
            FinancerBalanceEvent::FinancerInvoiceGenerated(FinancerInvoiceGenerated {
                tenant_id,
                financer_id: FinancerId::generate(),
                invoice_id: InvoiceId::generate(),
                amount: 1,
                occurred_at: Utc::now(),
            }),
        );
        let p = CreditBalancesProjection::new(Arc::new(InMemoryTenantStore::new()));
        assert!(matches!(p.apply_envelope(&env), Err(ProjectionError::TenantIsolation(_))));

        env = envelope(TenantId::new(), financer_id, 1, decode(&env).unwrap());
        assert!(p.apply_envelope(&env).is_err());
    }
}
