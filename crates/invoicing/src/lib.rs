//! Invoicing domain: billing periods, prorata and VAT rules, invoices, monthly
//! generation batches and balances.
//!
//! Pure, deterministic domain logic (no IO, no HTTP, no storage).

pub mod balance;
pub mod generation;
pub mod invoice;
pub mod numbering;
pub mod period;
pub mod policy;
pub mod prorata;
pub mod vat;

pub use balance::{
    BalanceLedger, DivisionBalance, DivisionBalanceCommand, DivisionBalanceEvent,
    DivisionInvoiceGenerated, DivisionInvoicePaid, FinancerBalance, FinancerBalanceCommand,
    FinancerBalanceEvent, FinancerInvoiceGenerated, FinancerInvoicePaid,
    RecordDivisionInvoiceGenerated, RecordDivisionInvoicePaid, RecordFinancerInvoiceGenerated,
    RecordFinancerInvoicePaid,
};
pub use generation::{
    BatchCompleted, BatchId, BatchStarted, BatchStatus, InvoiceCompleted, InvoiceFailed,
    InvoiceGeneration, InvoiceGenerationCommand, InvoiceGenerationEvent, InvoiceSkipped,
    RecordInvoiceCompleted, RecordInvoiceFailed, RecordInvoiceSkipped, StartBatch,
};
pub use invoice::{
    AddInvoiceItem, CancelInvoice, ConfirmInvoice, DeleteDraftInvoice, Invoice, InvoiceAmounts,
    InvoiceCommand, InvoiceEvent, InvoiceId, InvoiceItem, InvoiceItemId, InvoiceItemType,
    InvoiceMetadata, InvoiceParty, InvoiceStatus, IssueInvoice, MarkInvoiceOverdue,
    MarkInvoicePaid, MarkInvoiceSent, NewInvoiceItem, RemoveInvoiceItem, UpdateInvoice,
};
pub use numbering::{InvoiceNumber, InvoiceType};
pub use period::{BillingPeriod, DEFAULT_PAYMENT_TERM_DAYS};
pub use policy::InvoiceAccessFacts;
pub use prorata::{ProrataCalculation, ProrataPercentage};
