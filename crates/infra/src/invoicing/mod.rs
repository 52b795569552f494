//! Invoice generation: the service that issues one invoice, the jobs that
//! run it with retries, and the monthly run that plans a batch.

pub mod jobs;
pub mod monthly_run;
pub mod numbers;
pub mod service;

pub use jobs::{
    GenerateDivisionInvoicePayload, GenerateFinancerInvoicePayload, GenerationJobConfig, PaymentPosting,
    RECORD_GENERATION_FAILURE, RECORD_INVOICE_PAYMENT, RecordGenerationFailurePayload, RecordInvoicePaymentPayload,
    record_payment_or_defer, register_generation_handlers, unique_key,
};
pub use monthly_run::{MonthlyInvoiceRun, MonthlyRunError, MonthlyRunSummary, OrganizationDirectory};
pub use numbers::InvoiceNumberAllocator;
pub use service::{Clock, GenerationError, InvoiceGenerationService, batch_invoice_id, system_clock};
