//! Running balances of what a division owes the platform and what a financer
//! owes its division (credit balance).
//!
//! Balance streams live next to the organization streams, so their ids are
//! derived from the organization id rather than reusing it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use engage_events::{Command, Event};
use engage_organizations::{DivisionId, FinancerId};

use crate::invoice::InvoiceId;

fn derived_stream_id(owner: AggregateId, kind: &str) -> AggregateId {
    AggregateId::from_uuid(Uuid::new_v5(owner.as_uuid(), kind.as_bytes()))
}

/// Generated and paid amounts per invoice. Shared by both balance aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceLedger {
    generated: BTreeMap<InvoiceId, i64>,
    paid: BTreeMap<InvoiceId, i64>,
    last_invoice_at: Option<DateTime<Utc>>,
}

impl BalanceLedger {
    pub fn invoiced_total(&self) -> i64 {
        self.generated.values().sum()
    }

    pub fn paid_total(&self) -> i64 {
        self.paid.values().sum()
    }

    /// Σ generated − Σ paid.
    pub fn balance(&self) -> i64 {
        self.invoiced_total() - self.paid_total()
    }

    pub fn invoice_count(&self) -> usize {
        self.generated.len()
    }

    pub fn last_invoice_at(&self) -> Option<DateTime<Utc>> {
        self.last_invoice_at
    }

    /// `Ok(false)` when the invoice is already recorded.
    fn should_record_generated(&self, invoice_id: InvoiceId, amount: i64) -> Result<bool, DomainError> {
        if amount < 0 {
            return Err(DomainError::validation("invoice amount cannot be negative"));
        }
        Ok(!self.generated.contains_key(&invoice_id))
    }

    fn should_record_paid(&self, invoice_id: InvoiceId, amount: i64) -> Result<bool, DomainError> {
        if amount < 0 {
            return Err(DomainError::validation("payment amount cannot be negative"));
        }
        if !self.generated.contains_key(&invoice_id) {
            return Err(DomainError::invariant(format!(
                "payment recorded for unknown invoice {invoice_id}"
            )));
        }
        Ok(!self.paid.contains_key(&invoice_id))
    }

    fn record_generated(&mut self, invoice_id: InvoiceId, amount: i64, at: DateTime<Utc>) {
        self.generated.insert(invoice_id, amount);
        if self.last_invoice_at.is_none_or(|last| at >= last) {
            self.last_invoice_at = Some(at);
        }
    }

    fn record_paid(&mut self, invoice_id: InvoiceId, amount: i64) {
        self.paid.insert(invoice_id, amount);
    }
}

/// Aggregate root: DivisionBalance (what a division owes across its invoices).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivisionBalance {
    id: AggregateId,
    tenant_id: Option<TenantId>,
    division_id: Option<DivisionId>,
    ledger: BalanceLedger,
    version: u64,
}

impl DivisionBalance {
    pub const AGGREGATE_TYPE: &'static str = "invoicing.division_balance";

    pub fn stream_id(division_id: DivisionId) -> AggregateId {
        derived_stream_id(division_id.0, Self::AGGREGATE_TYPE)
    }

    pub fn empty(id: AggregateId) -> Self {
        Self { id, tenant_id: None, division_id: None, ledger: BalanceLedger::default(), version: 0 }
    }

    pub fn division_id(&self) -> Option<DivisionId> {
        self.division_id
    }

    pub fn ledger(&self) -> &BalanceLedger {
        &self.ledger
    }

    fn ensure_scope(&self, tenant_id: TenantId, division_id: DivisionId) -> Result<(), DomainError> {
        if self.version > 0 && self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != Self::stream_id(division_id) {
            return Err(DomainError::invariant("division_id does not match balance stream"));
        }
        Ok(())
    }
}

impl AggregateRoot for DivisionBalance {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RecordDivisionInvoiceGenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDivisionInvoiceGenerated {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordDivisionInvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDivisionInvoicePaid {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivisionBalanceCommand {
    RecordInvoiceGenerated(RecordDivisionInvoiceGenerated),
    RecordInvoicePaid(RecordDivisionInvoicePaid),
}

impl Command for DivisionBalanceCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        let division_id = match self {
            DivisionBalanceCommand::RecordInvoiceGenerated(c) => c.division_id,
            DivisionBalanceCommand::RecordInvoicePaid(c) => c.division_id,
        };
        DivisionBalance::stream_id(division_id)
    }
}

/// Event: DivisionInvoiceGenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionInvoiceGenerated {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DivisionInvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionInvoicePaid {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivisionBalanceEvent {
    DivisionInvoiceGenerated(DivisionInvoiceGenerated),
    DivisionInvoicePaid(DivisionInvoicePaid),
}

impl Event for DivisionBalanceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DivisionBalanceEvent::DivisionInvoiceGenerated(_) => "invoicing.division_balance.invoice_generated",
            DivisionBalanceEvent::DivisionInvoicePaid(_) => "invoicing.division_balance.invoice_paid",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DivisionBalanceEvent::DivisionInvoiceGenerated(e) => e.occurred_at,
            DivisionBalanceEvent::DivisionInvoicePaid(e) => e.occurred_at,
        }
    }
}

impl Aggregate for DivisionBalance {
    type Command = DivisionBalanceCommand;
    type Event = DivisionBalanceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DivisionBalanceEvent::DivisionInvoiceGenerated(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.division_id = Some(e.division_id);
                self.ledger.record_generated(e.invoice_id, e.amount, e.occurred_at);
            }
            DivisionBalanceEvent::DivisionInvoicePaid(e) => {
                self.ledger.record_paid(e.invoice_id, e.amount);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            DivisionBalanceCommand::RecordInvoiceGenerated(cmd) => {
                self.ensure_scope(cmd.tenant_id, cmd.division_id)?;
                if !self.ledger.should_record_generated(cmd.invoice_id, cmd.amount)? {
                    return Ok(vec![]);
                }
                Ok(vec![DivisionBalanceEvent::DivisionInvoiceGenerated(DivisionInvoiceGenerated {
                    tenant_id: cmd.tenant_id,
                    division_id: cmd.division_id,
                    invoice_id: cmd.invoice_id,
                    amount: cmd.amount,
                    occurred_at: cmd.occurred_at,
                })])
            }
            DivisionBalanceCommand::RecordInvoicePaid(cmd) => {
                self.ensure_scope(cmd.tenant_id, cmd.division_id)?;
                if !self.ledger.should_record_paid(cmd.invoice_id, cmd.amount)? {
                    return Ok(vec![]);
                }
                Ok(vec![DivisionBalanceEvent::DivisionInvoicePaid(DivisionInvoicePaid {
                    tenant_id: cmd.tenant_id,
                    division_id: cmd.division_id,
                    invoice_id: cmd.invoice_id,
                    amount: cmd.amount,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

/// Aggregate root: FinancerBalance (a financer's credit balance with its division).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinancerBalance {
    id: AggregateId,
    tenant_id: Option<TenantId>,
    financer_id: Option<FinancerId>,
    ledger: BalanceLedger,
    version: u64,
}

impl FinancerBalance {
    pub const AGGREGATE_TYPE: &'static str = "invoicing.financer_balance";

    pub fn stream_id(financer_id: FinancerId) -> AggregateId {
        derived_stream_id(financer_id.0, Self::AGGREGATE_TYPE)
    }

    pub fn empty(id: AggregateId) -> Self {
        Self { id, tenant_id: None, financer_id: None, ledger: BalanceLedger::default(), version: 0 }
    }

    pub fn financer_id(&self) -> Option<FinancerId> {
        self.financer_id
    }

    pub fn ledger(&self) -> &BalanceLedger {
        &self.ledger
    }

    fn ensure_scope(&self, tenant_id: TenantId, financer_id: FinancerId) -> Result<(), DomainError> {
        if self.version > 0 && self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != Self::stream_id(financer_id) {
            return Err(DomainError::invariant("financer_id does not match balance stream"));
        }
        Ok(())
    }
}

impl AggregateRoot for FinancerBalance {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RecordFinancerInvoiceGenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFinancerInvoiceGenerated {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordFinancerInvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFinancerInvoicePaid {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinancerBalanceCommand {
    RecordInvoiceGenerated(RecordFinancerInvoiceGenerated),
    RecordInvoicePaid(RecordFinancerInvoicePaid),
}

impl Command for FinancerBalanceCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        let financer_id = match self {
            FinancerBalanceCommand::RecordInvoiceGenerated(c) => c.financer_id,
            FinancerBalanceCommand::RecordInvoicePaid(c) => c.financer_id,
        };
        FinancerBalance::stream_id(financer_id)
    }
}

/// Event: FinancerInvoiceGenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancerInvoiceGenerated {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: FinancerInvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancerInvoicePaid {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub invoice_id: InvoiceId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinancerBalanceEvent {
    FinancerInvoiceGenerated(FinancerInvoiceGenerated),
    FinancerInvoicePaid(FinancerInvoicePaid),
}

impl Event for FinancerBalanceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FinancerBalanceEvent::FinancerInvoiceGenerated(_) => "invoicing.financer_balance.invoice_generated",
            FinancerBalanceEvent::FinancerInvoicePaid(_) => "invoicing.financer_balance.invoice_paid",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            FinancerBalanceEvent::FinancerInvoiceGenerated(e) => e.occurred_at,
            FinancerBalanceEvent::FinancerInvoicePaid(e) => e.occurred_at,
        }
    }
}

impl Aggregate for FinancerBalance {
    type Command = FinancerBalanceCommand;
    type Event = FinancerBalanceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            FinancerBalanceEvent::FinancerInvoiceGenerated(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.financer_id = Some(e.financer_id);
                self.ledger.record_generated(e.invoice_id, e.amount, e.occurred_at);
            }
            FinancerBalanceEvent::FinancerInvoicePaid(e) => {
                self.ledger.record_paid(e.invoice_id, e.amount);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            FinancerBalanceCommand::RecordInvoiceGenerated(cmd) => {
                self.ensure_scope(cmd.tenant_id, cmd.financer_id)?;
                if !self.ledger.should_record_generated(cmd.invoice_id, cmd.amount)? {
                    return Ok(vec![]);
                }
                Ok(vec![FinancerBalanceEvent::FinancerInvoiceGenerated(FinancerInvoiceGenerated {
                    tenant_id: cmd.tenant_id,
                    financer_id: cmd.financer_id,
                    invoice_id: cmd.invoice_id,
                    amount: cmd.amount,
                    occurred_at: cmd.occurred_at,
                })])
            }
            FinancerBalanceCommand::RecordInvoicePaid(cmd) => {
                self.ensure_scope(cmd.tenant_id, cmd.financer_id)?;
                if !self.ledger.should_record_paid(cmd.invoice_id, cmd.amount)? {
                    return Ok(vec![]);
                }
                Ok(vec![FinancerBalanceEvent::FinancerInvoicePaid(FinancerInvoicePaid {
                    tenant_id: cmd.tenant_id,
                    financer_id: cmd.financer_id,
                    invoice_id: cmd.invoice_id,
                    amount: cmd.amount,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use engage_events::execute;

    fn generated(tenant_id: TenantId, division_id: DivisionId, invoice_id: InvoiceId, amount: i64, at: DateTime<Utc>) -> DivisionBalanceCommand {
        DivisionBalanceCommand::RecordInvoiceGenerated(RecordDivisionInvoiceGenerated {
            tenant_id,
            division_id,
            invoice_id,
            amount,
            occurred_at: at,
        })
    }

    fn paid(tenant_id: TenantId, division_id: DivisionId, invoice_id: InvoiceId, amount: i64) -> DivisionBalanceCommand {
        DivisionBalanceCommand::RecordInvoicePaid(RecordDivisionInvoicePaid {
            tenant_id,
            division_id,
            invoice_id,
            amount,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn stream_ids_are_stable_and_distinct_from_the_owner() {
        let division_id = DivisionId::generate();
        assert_eq!(DivisionBalance::stream_id(division_id), DivisionBalance::stream_id(division_id));
        assert_ne!(DivisionBalance::stream_id(division_id), division_id.0);
        assert_ne!(
            DivisionBalance::stream_id(division_id),
            FinancerBalance::stream_id(FinancerId::new(division_id.0))
        );
    }

    #[test]
    fn balance_is_generated_minus_paid() {
        let tenant_id = TenantId::new();
        let division_id = DivisionId::generate();
        let mut balance = DivisionBalance::empty(DivisionBalance::stream_id(division_id));
        let (first, second) = (InvoiceId::generate(), InvoiceId::generate());
        let t0 = Utc::now();

        execute(&mut balance, &generated(tenant_id, division_id, first, 10_000, t0)).unwrap();
        execute(&mut balance, &generated(tenant_id, division_id, second, 2_500, t0 + Duration::days(30))).unwrap();
        execute(&mut balance, &paid(tenant_id, division_id, first, 10_000)).unwrap();

        assert_eq!(balance.ledger().balance(), 2_500);
        assert_eq!(balance.ledger().invoice_count(), 2);
        assert_eq!(balance.ledger().last_invoice_at(), Some(t0 + Duration::days(30)));
    }

    #[test]
    fn same_invoice_is_idempotent_per_kind() {
        let tenant_id = TenantId::new();
        let division_id = DivisionId::generate();
        let invoice_id = InvoiceId::generate();
        let mut balance = DivisionBalance::empty(DivisionBalance::stream_id(division_id));

        execute(&mut balance, &generated(tenant_id, division_id, invoice_id, 500, Utc::now())).unwrap();
        assert!(execute(&mut balance, &generated(tenant_id, division_id, invoice_id, 500, Utc::now())).unwrap().is_empty());
        execute(&mut balance, &paid(tenant_id, division_id, invoice_id, 500)).unwrap();
        assert!(execute(&mut balance, &paid(tenant_id, division_id, invoice_id, 500)).unwrap().is_empty());
        assert_eq!(balance.version(), 2);
    }

    #[test]
    fn payment_for_unknown_invoice_is_rejected() {
        let division_id = DivisionId::generate();
        let balance = DivisionBalance::empty(DivisionBalance::stream_id(division_id));
        let err = balance.handle(&paid(TenantId::new(), division_id, InvoiceId::generate(), 10)).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn negative_amounts_are_rejected() {
        let financer_id = FinancerId::generate();
        let balance = FinancerBalance::empty(FinancerBalance::stream_id(financer_id));
        let err = balance
            .handle(&FinancerBalanceCommand::RecordInvoiceGenerated(RecordFinancerInvoiceGenerated {
                tenant_id: TenantId::new(),
                financer_id,
                invoice_id: InvoiceId::generate(),
                amount: -1,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn replay_rebuilds_credit_balance_with_sequential_versions() {
        let tenant_id = TenantId::new();
        let financer_id = FinancerId::generate();
        let invoice_id = InvoiceId::generate();
        let mut balance = FinancerBalance::empty(FinancerBalance::stream_id(financer_id));
        let mut history = Vec::new();

        history.extend(
            execute(
                &mut balance,
                &FinancerBalanceCommand::RecordInvoiceGenerated(RecordFinancerInvoiceGenerated {
                    tenant_id,
                    financer_id,
                    invoice_id,
                    amount: 4_200,
                    occurred_at: Utc::now(),
                }),
            )
            .unwrap(),
        );
        history.extend(
            execute(
                &mut balance,
                &FinancerBalanceCommand::RecordInvoicePaid(RecordFinancerInvoicePaid {
                    tenant_id,
                    financer_id,
                    invoice_id,
                    amount: 1_200,
                    occurred_at: Utc::now(),
                }),
            )
            .unwrap(),
        );

        let replayed = FinancerBalance::empty(FinancerBalance::stream_id(financer_id)).rehydrate(history.iter());
        assert_eq!(replayed, balance);
        assert_eq!(replayed.version(), 2);
        assert_eq!(replayed.ledger().balance(), 3_000);
    }
}
