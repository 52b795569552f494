use core::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use engage_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId, VatRate};
use engage_events::{Command, Event};
use engage_organizations::{DivisionId, FinancerId, ModuleId};

use crate::numbering::{InvoiceNumber, InvoiceType};
use crate::period::BillingPeriod;
use crate::prorata::ProrataPercentage;

/// Invoice identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Invoice line identifier, unique within its invoice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceItemId(pub AggregateId);

impl InvoiceItemId {
    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for InvoiceItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Invoice status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Confirmed,
    Sent,
    Paid,
    Cancelled,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Confirmed => "confirmed",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Overdue => "overdue",
        }
    }
}

impl core::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "confirmed" => Ok(InvoiceStatus::Confirmed),
            "sent" => Ok(InvoiceStatus::Sent),
            "paid" => Ok(InvoiceStatus::Paid),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            "overdue" => Ok(InvoiceStatus::Overdue),
            other => Err(DomainError::validation(format!("unknown invoice status '{other}'"))),
        }
    }
}

/// Issuer or recipient of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum InvoiceParty {
    Hexeko,
    Division(DivisionId),
    Financer(FinancerId),
}

impl InvoiceParty {
    pub fn aggregate_id(&self) -> Option<AggregateId> {
        match self {
            InvoiceParty::Hexeko => None,
            InvoiceParty::Division(id) => Some(id.0),
            InvoiceParty::Financer(id) => Some(id.0),
        }
    }

    pub fn division_id(&self) -> Option<DivisionId> {
        match self {
            InvoiceParty::Division(id) => Some(*id),
            _ => None,
        }
    }

    pub fn financer_id(&self) -> Option<FinancerId> {
        match self {
            InvoiceParty::Financer(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceItemType {
    CorePackage,
    Module,
    Custom,
}

/// Item as requested by the caller; amounts are derived when it is priced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoiceItem {
    pub id: InvoiceItemId,
    pub item_type: InvoiceItemType,
    pub module_id: Option<ModuleId>,
    pub label: String,
    /// Cents.
    pub unit_price: i64,
    pub quantity: i64,
    #[serde(default)]
    pub prorata: ProrataPercentage,
    pub prorata_days: Option<i64>,
    pub total_days: Option<i64>,
    pub beneficiaries_count: Option<i64>,
}

/// Priced invoice line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: InvoiceItemId,
    pub item_type: InvoiceItemType,
    pub module_id: Option<ModuleId>,
    pub label: String,
    pub unit_price: i64,
    pub quantity: i64,
    pub prorata: ProrataPercentage,
    pub prorata_days: Option<i64>,
    pub total_days: Option<i64>,
    pub beneficiaries_count: Option<i64>,
    pub subtotal: i64,
    pub vat_amount: i64,
    pub total: i64,
}

impl InvoiceItem {
    /// `round(unit × quantity × prorata)` plus VAT on that subtotal.
    pub fn price(item: &NewInvoiceItem, vat_rate: VatRate) -> Result<Self, DomainError> {
        if item.quantity < 0 {
            return Err(DomainError::validation("invoice item quantity cannot be negative"));
        }
        if item.unit_price < 0 {
            return Err(DomainError::validation("invoice item unit_price cannot be negative"));
        }
        if item.label.trim().is_empty() {
            return Err(DomainError::validation("invoice item label cannot be empty"));
        }

        let gross = i128::from(item.unit_price) * i128::from(item.quantity);
        let subtotal = i64::try_from(item.prorata.apply(gross))
            .map_err(|_| DomainError::invariant("invoice item amount overflow"))?;
        let vat_amount = vat_rate.apply(subtotal);
        let total = subtotal
            .checked_add(vat_amount)
            .ok_or_else(|| DomainError::invariant("invoice item amount overflow"))?;

        Ok(Self {
            id: item.id,
            item_type: item.item_type,
            module_id: item.module_id,
            label: item.label.trim().to_string(),
            unit_price: item.unit_price,
            quantity: item.quantity,
            prorata: item.prorata,
            prorata_days: item.prorata_days,
            total_days: item.total_days,
            beneficiaries_count: item.beneficiaries_count,
            subtotal,
            vat_amount,
            total,
        })
    }
}

/// Invoice-level amounts in cents. VAT is computed on the summed subtotal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceAmounts {
    pub subtotal: i64,
    pub vat_amount: i64,
    pub total: i64,
}

impl InvoiceAmounts {
    pub fn compute(items: &[InvoiceItem], vat_rate: VatRate) -> Result<Self, DomainError> {
        let subtotal = items.iter().try_fold(0i64, |acc, item| {
            acc.checked_add(item.subtotal)
                .ok_or_else(|| DomainError::invariant("invoice total overflow"))
        })?;
        let vat_amount = vat_rate.apply(subtotal);
        let total = subtotal
            .checked_add(vat_amount)
            .ok_or_else(|| DomainError::invariant("invoice total overflow"))?;
        Ok(Self { subtotal, vat_amount, total })
    }
}

/// Where an invoice came from, for reporting and batch correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceMetadata {
    pub month_year: Option<String>,
    pub division_id: Option<DivisionId>,
    pub batch_id: Option<AggregateId>,
}

/// Aggregate root: Invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    tenant_id: Option<TenantId>,
    number: Option<InvoiceNumber>,
    invoice_type: InvoiceType,
    issuer: InvoiceParty,
    recipient: InvoiceParty,
    period: Option<BillingPeriod>,
    currency: String,
    vat_rate: VatRate,
    items: Vec<InvoiceItem>,
    amounts: InvoiceAmounts,
    amount_paid: i64,
    status: InvoiceStatus,
    due_date: Option<NaiveDate>,
    notes: Option<String>,
    metadata: InvoiceMetadata,
    issued_at: Option<DateTime<Utc>>,
    confirmed_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    deleted: bool,
    version: u64,
    created: bool,
}

impl Invoice {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            tenant_id: None,
            number: None,
            invoice_type: InvoiceType::HexekoToDivision,
            issuer: InvoiceParty::Hexeko,
            recipient: InvoiceParty::Hexeko,
            period: None,
            currency: String::new(),
            vat_rate: VatRate::percent(0),
            items: Vec::new(),
            amounts: InvoiceAmounts::default(),
            amount_paid: 0,
            status: InvoiceStatus::Draft,
            due_date: None,
            notes: None,
            metadata: InvoiceMetadata::default(),
            issued_at: None,
            confirmed_at: None,
            sent_at: None,
            paid_at: None,
            deleted: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// Issued and not deleted.
    pub fn exists(&self) -> bool {
        self.created && !self.deleted
    }

    pub fn number(&self) -> Option<&InvoiceNumber> {
        self.number.as_ref()
    }

    pub fn invoice_type(&self) -> InvoiceType {
        self.invoice_type
    }

    pub fn issuer(&self) -> InvoiceParty {
        self.issuer
    }

    pub fn recipient(&self) -> InvoiceParty {
        self.recipient
    }

    pub fn period(&self) -> Option<BillingPeriod> {
        self.period
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn vat_rate(&self) -> VatRate {
        self.vat_rate
    }

    pub fn items(&self) -> &[InvoiceItem] {
        &self.items
    }

    pub fn amounts(&self) -> InvoiceAmounts {
        self.amounts
    }

    pub fn amount_paid(&self) -> i64 {
        self.amount_paid
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due_date
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn metadata(&self) -> &InvoiceMetadata {
        &self.metadata
    }

    pub fn confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.confirmed_at
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: IssueInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub number: InvoiceNumber,
    pub invoice_type: InvoiceType,
    pub issuer: InvoiceParty,
    pub recipient: InvoiceParty,
    pub period: BillingPeriod,
    pub currency: String,
    pub vat_rate: VatRate,
    pub items: Vec<NewInvoiceItem>,
    /// Defaults to the period's payment term.
    pub due_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub metadata: InvoiceMetadata,
    /// `Draft` or `Confirmed`.
    pub status: InvoiceStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateInvoice. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddInvoiceItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddInvoiceItem {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub item: NewInvoiceItem,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveInvoiceItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveInvoiceItem {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub item_id: InvoiceItemId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInvoiceSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInvoiceSent {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInvoicePaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    /// Defaults to the invoice total.
    pub amount: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInvoiceOverdue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInvoiceOverdue {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub today: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteDraftInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDraftInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    IssueInvoice(IssueInvoice),
    UpdateInvoice(UpdateInvoice),
    AddInvoiceItem(AddInvoiceItem),
    RemoveInvoiceItem(RemoveInvoiceItem),
    ConfirmInvoice(ConfirmInvoice),
    MarkInvoiceSent(MarkInvoiceSent),
    MarkInvoicePaid(MarkInvoicePaid),
    MarkInvoiceOverdue(MarkInvoiceOverdue),
    CancelInvoice(CancelInvoice),
    DeleteDraftInvoice(DeleteDraftInvoice),
}

impl InvoiceCommand {
    pub fn invoice_id(&self) -> InvoiceId {
        match self {
            InvoiceCommand::IssueInvoice(c) => c.invoice_id,
            InvoiceCommand::UpdateInvoice(c) => c.invoice_id,
            InvoiceCommand::AddInvoiceItem(c) => c.invoice_id,
            InvoiceCommand::RemoveInvoiceItem(c) => c.invoice_id,
            InvoiceCommand::ConfirmInvoice(c) => c.invoice_id,
            InvoiceCommand::MarkInvoiceSent(c) => c.invoice_id,
            InvoiceCommand::MarkInvoicePaid(c) => c.invoice_id,
            InvoiceCommand::MarkInvoiceOverdue(c) => c.invoice_id,
            InvoiceCommand::CancelInvoice(c) => c.invoice_id,
            InvoiceCommand::DeleteDraftInvoice(c) => c.invoice_id,
        }
    }
}

impl Command for InvoiceCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.invoice_id().0
    }
}

/// Event: InvoiceIssued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceIssued {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub number: InvoiceNumber,
    pub invoice_type: InvoiceType,
    pub issuer: InvoiceParty,
    pub recipient: InvoiceParty,
    pub period: BillingPeriod,
    pub currency: String,
    pub vat_rate: VatRate,
    pub items: Vec<InvoiceItem>,
    pub amounts: InvoiceAmounts,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
    pub metadata: InvoiceMetadata,
    pub status: InvoiceStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceUpdated (header snapshot after the change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceUpdated {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceItemAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItemAdded {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub item: InvoiceItem,
    pub amounts: InvoiceAmounts,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceItemRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItemRemoved {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub item_id: InvoiceItemId,
    pub amounts: InvoiceAmounts,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceConfirmed {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSent {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub amount_paid: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceOverdue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceOverdue {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceDeleted. The stream is a tombstone afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDeleted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    InvoiceIssued(InvoiceIssued),
    InvoiceUpdated(InvoiceUpdated),
    InvoiceItemAdded(InvoiceItemAdded),
    InvoiceItemRemoved(InvoiceItemRemoved),
    InvoiceConfirmed(InvoiceConfirmed),
    InvoiceSent(InvoiceSent),
    InvoicePaid(InvoicePaid),
    InvoiceOverdue(InvoiceOverdue),
    InvoiceCancelled(InvoiceCancelled),
    InvoiceDeleted(InvoiceDeleted),
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::InvoiceIssued(_) => "invoicing.invoice.issued",
            InvoiceEvent::InvoiceUpdated(_) => "invoicing.invoice.updated",
            InvoiceEvent::InvoiceItemAdded(_) => "invoicing.invoice.item_added",
            InvoiceEvent::InvoiceItemRemoved(_) => "invoicing.invoice.item_removed",
            InvoiceEvent::InvoiceConfirmed(_) => "invoicing.invoice.confirmed",
            InvoiceEvent::InvoiceSent(_) => "invoicing.invoice.sent",
            InvoiceEvent::InvoicePaid(_) => "invoicing.invoice.paid",
            InvoiceEvent::InvoiceOverdue(_) => "invoicing.invoice.overdue",
            InvoiceEvent::InvoiceCancelled(_) => "invoicing.invoice.cancelled",
            InvoiceEvent::InvoiceDeleted(_) => "invoicing.invoice.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::InvoiceIssued(e) => e.occurred_at,
            InvoiceEvent::InvoiceUpdated(e) => e.occurred_at,
            InvoiceEvent::InvoiceItemAdded(e) => e.occurred_at,
            InvoiceEvent::InvoiceItemRemoved(e) => e.occurred_at,
            InvoiceEvent::InvoiceConfirmed(e) => e.occurred_at,
            InvoiceEvent::InvoiceSent(e) => e.occurred_at,
            InvoiceEvent::InvoicePaid(e) => e.occurred_at,
            InvoiceEvent::InvoiceOverdue(e) => e.occurred_at,
            InvoiceEvent::InvoiceCancelled(e) => e.occurred_at,
            InvoiceEvent::InvoiceDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::InvoiceIssued(e) => {
                self.id = e.invoice_id;
                self.tenant_id = Some(e.tenant_id);
                self.number = Some(e.number.clone());
                self.invoice_type = e.invoice_type;
                self.issuer = e.issuer;
                self.recipient = e.recipient;
                self.period = Some(e.period);
                self.currency = e.currency.clone();
                self.vat_rate = e.vat_rate;
                self.items = e.items.clone();
                self.amounts = e.amounts;
                self.due_date = Some(e.due_date);
                self.notes = e.notes.clone();
                self.metadata = e.metadata.clone();
                self.status = e.status;
                self.issued_at = Some(e.occurred_at);
                if e.status == InvoiceStatus::Confirmed {
                    self.confirmed_at = Some(e.occurred_at);
                }
                self.created = true;
            }
            InvoiceEvent::InvoiceUpdated(e) => {
                self.notes = e.notes.clone();
                self.due_date = e.due_date;
                self.currency = e.currency.clone();
            }
            InvoiceEvent::InvoiceItemAdded(e) => {
                self.items.push(e.item.clone());
                self.amounts = e.amounts;
            }
            InvoiceEvent::InvoiceItemRemoved(e) => {
                self.items.retain(|item| item.id != e.item_id);
                self.amounts = e.amounts;
            }
            InvoiceEvent::InvoiceConfirmed(e) => {
                self.status = InvoiceStatus::Confirmed;
                self.confirmed_at = Some(e.occurred_at);
            }
            InvoiceEvent::InvoiceSent(e) => {
                self.status = InvoiceStatus::Sent;
                self.sent_at = Some(e.occurred_at);
            }
            InvoiceEvent::InvoicePaid(e) => {
                self.status = InvoiceStatus::Paid;
                self.amount_paid = e.amount_paid;
                self.paid_at = Some(e.occurred_at);
            }
            InvoiceEvent::InvoiceOverdue(_) => {
                self.status = InvoiceStatus::Overdue;
            }
            InvoiceEvent::InvoiceCancelled(_) => {
                self.status = InvoiceStatus::Cancelled;
            }
            InvoiceEvent::InvoiceDeleted(_) => {
                self.deleted = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::IssueInvoice(cmd) => self.handle_issue(cmd),
            InvoiceCommand::UpdateInvoice(cmd) => self.handle_update(cmd),
            InvoiceCommand::AddInvoiceItem(cmd) => self.handle_add_item(cmd),
            InvoiceCommand::RemoveInvoiceItem(cmd) => self.handle_remove_item(cmd),
            InvoiceCommand::ConfirmInvoice(cmd) => self.handle_confirm(cmd),
            InvoiceCommand::MarkInvoiceSent(cmd) => self.handle_mark_sent(cmd),
            InvoiceCommand::MarkInvoicePaid(cmd) => self.handle_mark_paid(cmd),
            InvoiceCommand::MarkInvoiceOverdue(cmd) => self.handle_mark_overdue(cmd),
            InvoiceCommand::CancelInvoice(cmd) => self.handle_cancel(cmd),
            InvoiceCommand::DeleteDraftInvoice(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Invoice {
    fn ensure_existing(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Result<(), DomainError> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != invoice_id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }
        Ok(())
    }

    fn ensure_status(&self, allowed: &[InvoiceStatus], action: &str) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(DomainError::invariant(format!(
            "cannot {action} an invoice with status {}",
            self.status
        )))
    }

    fn handle_issue(&self, cmd: &IssueInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }

        let parties_match = match cmd.invoice_type {
            InvoiceType::HexekoToDivision => {
                cmd.issuer == InvoiceParty::Hexeko && cmd.recipient.division_id().is_some()
            }
            InvoiceType::DivisionToFinancer => {
                cmd.issuer.division_id().is_some() && cmd.recipient.financer_id().is_some()
            }
        };
        if !parties_match {
            return Err(DomainError::validation(format!(
                "issuer and recipient do not match invoice type {}",
                cmd.invoice_type
            )));
        }

        if !matches!(cmd.status, InvoiceStatus::Draft | InvoiceStatus::Confirmed) {
            return Err(DomainError::validation("invoices are issued as draft or confirmed"));
        }

        let currency = normalize_currency(&cmd.currency)?;
        let due_date = cmd.due_date.unwrap_or_else(|| cmd.period.default_due_date());

        let mut items = Vec::with_capacity(cmd.items.len());
        for item in &cmd.items {
            if items.iter().any(|i: &InvoiceItem| i.id == item.id) {
                return Err(DomainError::validation(format!("duplicate invoice item id {}", item.id)));
            }
            items.push(InvoiceItem::price(item, cmd.vat_rate)?);
        }
        let amounts = InvoiceAmounts::compute(&items, cmd.vat_rate)?;

        Ok(vec![InvoiceEvent::InvoiceIssued(InvoiceIssued {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            number: cmd.number.clone(),
            invoice_type: cmd.invoice_type,
            issuer: cmd.issuer,
            recipient: cmd.recipient,
            period: cmd.period,
            currency,
            vat_rate: cmd.vat_rate,
            items,
            amounts,
            due_date,
            notes: cmd.notes.clone(),
            metadata: cmd.metadata.clone(),
            status: cmd.status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(&[InvoiceStatus::Draft], "update")?;

        let currency = match &cmd.currency {
            Some(c) => normalize_currency(c)?,
            None => self.currency.clone(),
        };

        Ok(vec![InvoiceEvent::InvoiceUpdated(InvoiceUpdated {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            notes: cmd.notes.clone().or_else(|| self.notes.clone()),
            due_date: cmd.due_date.or(self.due_date),
            currency,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_item(&self, cmd: &AddInvoiceItem) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(&[InvoiceStatus::Draft], "add items to")?;

        if self.items.iter().any(|i| i.id == cmd.item.id) {
            return Err(DomainError::conflict(format!("invoice item {} already exists", cmd.item.id)));
        }

        let item = InvoiceItem::price(&cmd.item, self.vat_rate)?;
        let mut items = self.items.clone();
        items.push(item.clone());
        let amounts = InvoiceAmounts::compute(&items, self.vat_rate)?;

        Ok(vec![InvoiceEvent::InvoiceItemAdded(InvoiceItemAdded {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            item,
            amounts,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_item(&self, cmd: &RemoveInvoiceItem) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(&[InvoiceStatus::Draft], "remove items from")?;

        if !self.items.iter().any(|i| i.id == cmd.item_id) {
            return Err(DomainError::not_found());
        }

        let remaining: Vec<InvoiceItem> =
            self.items.iter().filter(|i| i.id != cmd.item_id).cloned().collect();
        let amounts = InvoiceAmounts::compute(&remaining, self.vat_rate)?;

        Ok(vec![InvoiceEvent::InvoiceItemRemoved(InvoiceItemRemoved {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            item_id: cmd.item_id,
            amounts,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(&[InvoiceStatus::Draft], "confirm")?;

        Ok(vec![InvoiceEvent::InvoiceConfirmed(InvoiceConfirmed {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_sent(&self, cmd: &MarkInvoiceSent) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(&[InvoiceStatus::Confirmed], "send")?;

        Ok(vec![InvoiceEvent::InvoiceSent(InvoiceSent {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_paid(&self, cmd: &MarkInvoicePaid) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(
            &[InvoiceStatus::Confirmed, InvoiceStatus::Sent, InvoiceStatus::Overdue],
            "mark as paid",
        )?;

        let amount = cmd.amount.unwrap_or(self.amounts.total);
        if amount <= 0 {
            return Err(DomainError::invariant("payment amount must be positive"));
        }
        if amount > self.amounts.total {
            return Err(DomainError::invariant("payment amount exceeds invoice total"));
        }

        Ok(vec![InvoiceEvent::InvoicePaid(InvoicePaid {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            amount_paid: amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_overdue(&self, cmd: &MarkInvoiceOverdue) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(&[InvoiceStatus::Confirmed, InvoiceStatus::Sent], "mark as overdue")?;

        let past_due = self.due_date.is_some_and(|due| cmd.today > due);
        if !past_due {
            return Err(DomainError::invariant("invoice is not past its due date"));
        }

        Ok(vec![InvoiceEvent::InvoiceOverdue(InvoiceOverdue {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(
            &[
                InvoiceStatus::Draft,
                InvoiceStatus::Confirmed,
                InvoiceStatus::Sent,
                InvoiceStatus::Overdue,
            ],
            "cancel",
        )?;

        Ok(vec![InvoiceEvent::InvoiceCancelled(InvoiceCancelled {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteDraftInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status(&[InvoiceStatus::Draft], "delete")?;

        Ok(vec![InvoiceEvent::InvoiceDeleted(InvoiceDeleted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn normalize_currency(raw: &str) -> Result<String, DomainError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DomainError::validation(format!(
            "currency must be a 3-letter ISO code, got '{raw}'"
        )));
    }
    Ok(code)
}
