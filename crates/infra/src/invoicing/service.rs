//! Turns organization data into invoices, one recipient at a time.
//!
//! Every step is safe to repeat: the invoice id is derived from the batch and
//! the recipient, the balance ledgers ignore invoices they already hold, and
//! the batch ignores recipients it already counted. A retried job therefore
//! converges on the same state instead of issuing a second invoice.
//!
//! Jobs run on several workers and all report to the same batch and division
//! ledger streams, so every write here is retried on a stale revision.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use engage_core::{Aggregate, AggregateId, DomainError, TenantId};
use engage_events::{Command, EventBus, EventEnvelope};
use engage_invoicing::prorata::{contract_calculation, module_prorata};
use engage_invoicing::vat::resolve_rate;
use engage_invoicing::{
    BatchId, BillingPeriod, DivisionBalance, DivisionBalanceCommand, FinancerBalance, FinancerBalanceCommand,
    Invoice, InvoiceCommand, InvoiceGeneration, InvoiceGenerationCommand, InvoiceId, InvoiceItemId,
    InvoiceItemType, InvoiceMetadata, InvoiceParty, InvoiceStatus, InvoiceType, IssueInvoice, NewInvoiceItem,
    RecordDivisionInvoiceGenerated, RecordDivisionInvoicePaid, RecordFinancerInvoiceGenerated,
    RecordFinancerInvoicePaid, RecordInvoiceCompleted, RecordInvoiceFailed, RecordInvoiceSkipped, StartBatch,
};
use engage_organizations::{Division, DivisionId, Financer, FinancerId};

use super::numbers::InvoiceNumberAllocator;
use crate::command_dispatcher::{CommandDispatcher, DEFAULT_CONFLICT_ATTEMPTS, DispatchError};
use crate::event_store::EventStore;
use crate::projections::invoice_generation::BATCH_AGGREGATE_TYPE;
use crate::projections::invoices::INVOICE_AGGREGATE_TYPE;

pub const CORE_PACKAGE_LABEL: &str = "Core package";
pub const NO_BENEFICIARIES_REASON: &str = "no active beneficiaries";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Cannot generate division invoice without active beneficiaries.")]
    NoActiveBeneficiaries,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl GenerationError {
    /// Retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            GenerationError::NotFound(_)
                | GenerationError::NoActiveBeneficiaries
                | GenerationError::Domain(DomainError::Validation(_))
        )
    }
}

/// Deterministic id of the invoice a batch issues to one recipient.
pub fn batch_invoice_id(batch_id: BatchId, recipient: AggregateId) -> InvoiceId {
    InvoiceId(AggregateId::from_uuid(Uuid::new_v5(batch_id.0.as_uuid(), recipient.as_uuid().as_bytes())))
}

pub struct InvoiceGenerationService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    numbers: Arc<InvoiceNumberAllocator>,
    clock: Clock,
}

impl<S, B> InvoiceGenerationService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>, numbers: Arc<InvoiceNumberAllocator>, clock: Clock) -> Self {
        Self { dispatcher, numbers, clock }
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }

    /// Bill one financer for the month. `None` when it had no active
    /// beneficiaries; the batch records a skip in that case.
    pub fn generate_financer_invoice(
        &self,
        tenant_id: TenantId,
        financer_id: FinancerId,
        month_year: &str,
        batch_id: BatchId,
    ) -> Result<Option<InvoiceId>, GenerationError> {
        let period = BillingPeriod::from_month_year(month_year)?;
        let financer = self
            .load_financer(tenant_id, financer_id)?
            .ok_or_else(|| GenerationError::NotFound(format!("financer {financer_id}")))?;
        let division_id = financer
            .division_id()
            .ok_or_else(|| GenerationError::NotFound(format!("division of financer {financer_id}")))?;
        let division = self
            .load_division(tenant_id, division_id)?
            .ok_or_else(|| GenerationError::NotFound(format!("division {division_id}")))?;

        let beneficiaries = financer.active_beneficiaries_between(period.start(), period.end()) as i64;
        if beneficiaries == 0 {
            self.record_skip(tenant_id, batch_id, financer_id.0, NO_BENEFICIARIES_REASON)?;
            info!(%tenant_id, %financer_id, %batch_id, month_year, "financer invoice skipped: no active beneficiaries");
            return Ok(None);
        }

        let core = contract_calculation(financer.contract_start_date(), &period);
        let mut items = vec![NewInvoiceItem {
            id: InvoiceItemId::generate(),
            item_type: InvoiceItemType::CorePackage,
            module_id: None,
            label: CORE_PACKAGE_LABEL.to_string(),
            unit_price: financer.core_package_price().or(division.core_package_price()).unwrap_or(0),
            quantity: beneficiaries,
            prorata: core.percentage,
            prorata_days: Some(core.days),
            total_days: Some(core.total_days),
            beneficiaries_count: Some(beneficiaries),
        }];

        for subscription in financer.billable_modules_between(period.start(), period.end()) {
            let calc = module_prorata(subscription, &period);
            items.push(NewInvoiceItem {
                id: InvoiceItemId::generate(),
                item_type: InvoiceItemType::Module,
                module_id: Some(subscription.module_id),
                label: format!("Module {}", subscription.module_id),
                unit_price: subscription
                    .price_per_beneficiary
                    .or(division.module_price(subscription.module_id))
                    .unwrap_or(0),
                quantity: beneficiaries,
                prorata: calc.percentage,
                prorata_days: Some(calc.days),
                total_days: Some(calc.total_days),
                beneficiaries_count: Some(beneficiaries),
            });
        }

        let invoice_id = batch_invoice_id(batch_id, financer_id.0);
        let total = self.issue_once(tenant_id, invoice_id, InvoiceType::DivisionToFinancer, &period, |number| IssueInvoice {
            tenant_id,
            invoice_id,
            number,
            invoice_type: InvoiceType::DivisionToFinancer,
            issuer: InvoiceParty::Division(division_id),
            recipient: InvoiceParty::Financer(financer_id),
            period,
            currency: currency_of(&division),
            vat_rate: resolve_rate(division.vat_rate(), division.country()),
            items,
            due_date: None,
            notes: None,
            metadata: InvoiceMetadata {
                month_year: Some(period.month_year()),
                division_id: Some(division_id),
                batch_id: Some(batch_id.0),
            },
            status: InvoiceStatus::Confirmed,
            occurred_at: self.now(),
        })?;

        self.record_generated(tenant_id, invoice_id, Some(division_id), Some(financer_id), total)?;
        self.complete(tenant_id, batch_id, financer_id.0, invoice_id)?;

        info!(%tenant_id, %financer_id, %invoice_id, %batch_id, month_year, total, "financer invoice generated");
        Ok(Some(invoice_id))
    }

    /// Bill a division for the beneficiaries of the listed financers that
    /// belong to it.
    pub fn generate_division_invoice(
        &self,
        tenant_id: TenantId,
        division_id: DivisionId,
        financer_ids: &[FinancerId],
        month_year: &str,
        batch_id: BatchId,
    ) -> Result<InvoiceId, GenerationError> {
        let period = BillingPeriod::from_month_year(month_year)?;
        let division = self
            .load_division(tenant_id, division_id)?
            .ok_or_else(|| GenerationError::NotFound(format!("division {division_id}")))?;

        let mut beneficiaries = 0i64;
        for financer_id in financer_ids {
            if let Some(financer) = self.load_financer(tenant_id, *financer_id)? {
                if financer.division_id() == Some(division_id) {
                    beneficiaries += financer.active_beneficiaries_between(period.start(), period.end()) as i64;
                }
            }
        }
        if beneficiaries == 0 {
            return Err(GenerationError::NoActiveBeneficiaries);
        }

        let core = contract_calculation(division.contract_start_date(), &period);
        let items = vec![NewInvoiceItem {
            id: InvoiceItemId::generate(),
            item_type: InvoiceItemType::CorePackage,
            module_id: None,
            label: CORE_PACKAGE_LABEL.to_string(),
            unit_price: division.core_package_price().unwrap_or(0),
            quantity: beneficiaries,
            prorata: core.percentage,
            prorata_days: Some(core.days),
            total_days: Some(core.total_days),
            beneficiaries_count: Some(beneficiaries),
        }];

        let invoice_id = batch_invoice_id(batch_id, division_id.0);
        let total = self.issue_once(tenant_id, invoice_id, InvoiceType::HexekoToDivision, &period, |number| IssueInvoice {
            tenant_id,
            invoice_id,
            number,
            invoice_type: InvoiceType::HexekoToDivision,
            issuer: InvoiceParty::Hexeko,
            recipient: InvoiceParty::Division(division_id),
            period,
            currency: currency_of(&division),
            vat_rate: resolve_rate(division.vat_rate(), division.country()),
            items,
            due_date: None,
            notes: None,
            metadata: InvoiceMetadata {
                month_year: Some(period.month_year()),
                division_id: Some(division_id),
                batch_id: Some(batch_id.0),
            },
            status: InvoiceStatus::Draft,
            occurred_at: self.now(),
        })?;

        self.record_generated(tenant_id, invoice_id, Some(division_id), None, total)?;
        self.complete(tenant_id, batch_id, division_id.0, invoice_id)?;

        info!(%tenant_id, %division_id, %invoice_id, %batch_id, month_year, beneficiaries, total, "division invoice generated");
        Ok(invoice_id)
    }

    /// Record a payment in the ledgers that hold the invoice. Invoices created
    /// outside a generation batch are not tracked by the ledgers.
    pub fn record_payment(&self, tenant_id: TenantId, invoice: &Invoice, amount: i64) -> Result<(), GenerationError> {
        if invoice.metadata().batch_id.is_none() || amount <= 0 {
            return Ok(());
        }
        let invoice_id = invoice.id_typed();
        let (division_id, financer_id) = ledger_owners(invoice);
        let occurred_at = self.now();

        if let Some(division_id) = division_id {
            self.dispatch::<DivisionBalance>(
                tenant_id,
                DivisionBalance::AGGREGATE_TYPE,
                DivisionBalanceCommand::RecordInvoicePaid(RecordDivisionInvoicePaid {
                    tenant_id,
                    division_id,
                    invoice_id,
                    amount,
                    occurred_at,
                }),
                DivisionBalance::empty,
            )?;
        }
        if let Some(financer_id) = financer_id {
            self.dispatch::<FinancerBalance>(
                tenant_id,
                FinancerBalance::AGGREGATE_TYPE,
                FinancerBalanceCommand::RecordInvoicePaid(RecordFinancerInvoicePaid {
                    tenant_id,
                    financer_id,
                    invoice_id,
                    amount,
                    occurred_at,
                }),
                FinancerBalance::empty,
            )?;
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn load_financer(&self, tenant_id: TenantId, id: FinancerId) -> Result<Option<Financer>, DispatchError> {
        self.dispatcher.load(tenant_id, id.0, |_, id| Financer::empty(FinancerId(id)))
    }

    fn load_division(&self, tenant_id: TenantId, id: DivisionId) -> Result<Option<Division>, DispatchError> {
        self.dispatcher.load(tenant_id, id.0, |_, id| Division::empty(DivisionId(id)))
    }

    fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        command: A::Command,
        make: impl Fn(AggregateId) -> A,
    ) -> Result<(), DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command + Clone,
        A::Event: engage_events::Event + Serialize + DeserializeOwned,
    {
        self.dispatcher
            .dispatch_with_retry(tenant_id, aggregate_type, &command, |_, id| make(id), DEFAULT_CONFLICT_ATTEMPTS)?;
        Ok(())
    }

    /// Issue the invoice unless a previous attempt already did; returns its
    /// total. A number is only allocated when the invoice is actually issued.
    fn issue_once(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        invoice_type: InvoiceType,
        period: &BillingPeriod,
        build: impl FnOnce(engage_invoicing::InvoiceNumber) -> IssueInvoice,
    ) -> Result<i64, GenerationError> {
        let load = || self.dispatcher.load(tenant_id, invoice_id.0, |_, id| Invoice::empty(InvoiceId(id)));

        if load()?.is_none() {
            let number = self.numbers.next(tenant_id, invoice_type, period.start().year())?;
            let issued = self.dispatch::<Invoice>(
                tenant_id,
                INVOICE_AGGREGATE_TYPE,
                InvoiceCommand::IssueInvoice(build(number)),
                |id| Invoice::empty(InvoiceId(id)),
            );
            match issued {
                // Another attempt issued it between the load and the append.
                Ok(()) | Err(DispatchError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        load()?
            .map(|invoice| invoice.amounts().total)
            .ok_or_else(|| GenerationError::NotFound(format!("invoice {invoice_id}")))
    }

    fn record_generated(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        division_id: Option<DivisionId>,
        financer_id: Option<FinancerId>,
        amount: i64,
    ) -> Result<(), DispatchError> {
        let occurred_at = self.now();
        if let Some(division_id) = division_id {
            self.dispatch::<DivisionBalance>(
                tenant_id,
                DivisionBalance::AGGREGATE_TYPE,
                DivisionBalanceCommand::RecordInvoiceGenerated(RecordDivisionInvoiceGenerated {
                    tenant_id,
                    division_id,
                    invoice_id,
                    amount,
                    occurred_at,
                }),
                DivisionBalance::empty,
            )?;
        }
        if let Some(financer_id) = financer_id {
            self.dispatch::<FinancerBalance>(
                tenant_id,
                FinancerBalance::AGGREGATE_TYPE,
                FinancerBalanceCommand::RecordInvoiceGenerated(RecordFinancerInvoiceGenerated {
                    tenant_id,
                    financer_id,
                    invoice_id,
                    amount,
                    occurred_at,
                }),
                FinancerBalance::empty,
            )?;
        }
        Ok(())
    }

    fn complete(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        entity_id: AggregateId,
        invoice_id: InvoiceId,
    ) -> Result<(), DispatchError> {
        self.record_batch(
            tenant_id,
            InvoiceGenerationCommand::RecordInvoiceCompleted(RecordInvoiceCompleted {
                tenant_id,
                batch_id,
                entity_id,
                invoice_id,
                occurred_at: self.now(),
            }),
        )
    }

    pub fn start_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        month_year: &str,
        total: u32,
        division_id: Option<DivisionId>,
    ) -> Result<(), DispatchError> {
        self.record_batch(
            tenant_id,
            InvoiceGenerationCommand::StartBatch(StartBatch {
                tenant_id,
                batch_id,
                month_year: month_year.to_string(),
                total,
                division_id,
                occurred_at: self.now(),
            }),
        )
    }

    pub fn record_skip(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        entity_id: AggregateId,
        reason: &str,
    ) -> Result<(), DispatchError> {
        self.record_batch(
            tenant_id,
            InvoiceGenerationCommand::RecordInvoiceSkipped(RecordInvoiceSkipped {
                tenant_id,
                batch_id,
                entity_id,
                reason: reason.to_string(),
                occurred_at: self.now(),
            }),
        )
    }

    /// Count a recipient as failed on its batch, once its job gave up.
    pub fn record_failure(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        entity_id: AggregateId,
        error: &str,
    ) -> Result<(), DispatchError> {
        self.record_batch(
            tenant_id,
            InvoiceGenerationCommand::RecordInvoiceFailed(RecordInvoiceFailed {
                tenant_id,
                batch_id,
                entity_id,
                error: error.to_string(),
                occurred_at: self.now(),
            }),
        )
    }

    fn record_batch(&self, tenant_id: TenantId, command: InvoiceGenerationCommand) -> Result<(), DispatchError> {
        self.dispatch::<InvoiceGeneration>(tenant_id, BATCH_AGGREGATE_TYPE, command, |id| {
            InvoiceGeneration::empty(BatchId(id))
        })
    }
}

fn currency_of(division: &Division) -> String {
    match division.currency() {
        "" => "EUR".to_string(),
        c => c.to_string(),
    }
}

/// Division and financer ledgers an invoice belongs to.
fn ledger_owners(invoice: &Invoice) -> (Option<DivisionId>, Option<FinancerId>) {
    match invoice.invoice_type() {
        InvoiceType::HexekoToDivision => (invoice.recipient().division_id(), None),
        InvoiceType::DivisionToFinancer => (invoice.issuer().division_id(), invoice.recipient().financer_id()),
    }
}
