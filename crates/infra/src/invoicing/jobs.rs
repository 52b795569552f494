//! Generation jobs: payloads, retry settings and executor wiring.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use engage_core::{AggregateId, TenantId};
use engage_events::{EventBus, EventEnvelope};
use engage_invoicing::{BatchId, Invoice, InvoiceId};
use engage_organizations::{DivisionId, FinancerId};

use super::service::{GenerationError, InvoiceGenerationService};
use crate::event_store::EventStore;
use crate::jobs::{
    GENERATE_DIVISION_INVOICE, GENERATE_FINANCER_INVOICE, Job, JobExecutor, JobId, JobKind, JobResult, JobStore,
    JobStoreError, RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateFinancerInvoicePayload {
    pub batch_id: BatchId,
    pub financer_id: FinancerId,
    pub month_year: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateDivisionInvoicePayload {
    pub batch_id: BatchId,
    pub division_id: DivisionId,
    pub financer_ids: Vec<FinancerId>,
    pub month_year: String,
}

/// Job kind that records a dead-lettered generation job on its batch when the
/// dead-letter hook itself could not.
pub const RECORD_GENERATION_FAILURE: &str = "invoicing.record_generation_failure";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordGenerationFailurePayload {
    pub batch_id: BatchId,
    pub entity_id: AggregateId,
    pub error: String,
}

/// Job kind that books a payment on the balance ledgers after the synchronous
/// attempt failed.
pub const RECORD_INVOICE_PAYMENT: &str = "invoicing.record_invoice_payment";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInvoicePaymentPayload {
    pub invoice_id: InvoiceId,
    pub amount: i64,
}

/// Where a payment ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentPosting {
    Recorded,
    Deferred(JobId),
}

/// Tries per job and the fixed wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationJobConfig {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for GenerationJobConfig {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Duration::from_secs(60) }
    }
}

impl GenerationJobConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts.max(1), self.backoff)
    }
}

/// At most one unfinished job per recipient and month.
pub fn unique_key(entity_id: AggregateId, month_year: &str) -> String {
    format!("{entity_id}:{month_year}")
}

pub fn financer_job(
    tenant_id: TenantId,
    payload: &GenerateFinancerInvoicePayload,
    config: &GenerationJobConfig,
) -> Result<Job, serde_json::Error> {
    Ok(Job::new(tenant_id, JobKind::GenerateFinancerInvoice, serde_json::to_value(payload)?)
        .with_unique_key(unique_key(payload.financer_id.0, &payload.month_year))
        .with_retry_policy(config.retry_policy()))
}

pub fn division_job(
    tenant_id: TenantId,
    payload: &GenerateDivisionInvoicePayload,
    config: &GenerationJobConfig,
) -> Result<Job, serde_json::Error> {
    Ok(Job::new(tenant_id, JobKind::GenerateDivisionInvoice, serde_json::to_value(payload)?)
        .with_unique_key(unique_key(payload.division_id.0, &payload.month_year))
        .with_retry_policy(config.retry_policy()))
}

pub fn record_failure_job(
    tenant_id: TenantId,
    payload: &RecordGenerationFailurePayload,
) -> Result<Job, serde_json::Error> {
    Ok(Job::new(tenant_id, JobKind::custom(RECORD_GENERATION_FAILURE), serde_json::to_value(payload)?)
        .with_unique_key(format!("failure:{}:{}", payload.batch_id.0, payload.entity_id))
        .with_retry_policy(RetryPolicy::fixed(10, Duration::from_secs(1))))
}

pub fn payment_job(tenant_id: TenantId, payload: &RecordInvoicePaymentPayload) -> Result<Job, serde_json::Error> {
    Ok(Job::new(tenant_id, JobKind::custom(RECORD_INVOICE_PAYMENT), serde_json::to_value(payload)?)
        .with_unique_key(format!("payment:{}", payload.invoice_id.0))
        .with_retry_policy(RetryPolicy::fixed(10, Duration::from_secs(5))))
}

/// Book a paid invoice on its ledgers, or queue the posting when the ledgers
/// reject it. The invoice is already paid at this point, so the posting must
/// not be lost; the ledgers ignore an invoice they already hold.
pub fn record_payment_or_defer<J, S, B>(
    jobs: &J,
    service: &InvoiceGenerationService<S, B>,
    tenant_id: TenantId,
    invoice: &Invoice,
    amount: i64,
) -> Result<PaymentPosting, JobStoreError>
where
    J: JobStore + ?Sized,
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    let invoice_id = invoice.id_typed();
    let Err(e) = service.record_payment(tenant_id, invoice, amount) else {
        return Ok(PaymentPosting::Recorded);
    };

    warn!(%tenant_id, %invoice_id, error = %e, "payment posting deferred to a job");
    let job = payment_job(tenant_id, &RecordInvoicePaymentPayload { invoice_id, amount })
        .map_err(|e| JobStoreError::Storage(e.to_string()))?;
    match jobs.enqueue(job) {
        Ok(job_id) | Err(JobStoreError::AlreadyExists(job_id)) => Ok(PaymentPosting::Deferred(job_id)),
        Err(e) => Err(e),
    }
}

/// Batch and recipient a generation job reports to.
fn job_target(job: &Job) -> Option<(BatchId, AggregateId)> {
    match job.kind {
        JobKind::GenerateFinancerInvoice => serde_json::from_value::<GenerateFinancerInvoicePayload>(job.payload.clone())
            .ok()
            .map(|p| (p.batch_id, p.financer_id.0)),
        JobKind::GenerateDivisionInvoice => serde_json::from_value::<GenerateDivisionInvoicePayload>(job.payload.clone())
            .ok()
            .map(|p| (p.batch_id, p.division_id.0)),
        _ => None,
    }
}

fn outcome<T>(job: &Job, result: Result<T, GenerationError>) -> JobResult {
    match result {
        Ok(_) => JobResult::Success,
        Err(e) => {
            if e.is_permanent() {
                warn!(job_id = %job.id, error = %e, "generation job failed permanently");
            }
            JobResult::Failure(e.to_string())
        }
    }
}

/// Register both generation handlers, and the hook that records a
/// dead-lettered job as a failure on its batch. A failure the hook cannot
/// write is queued as a [`RECORD_GENERATION_FAILURE`] job, so the batch still
/// gets every outcome.
pub fn register_generation_handlers<J, S, B>(
    executor: &mut JobExecutor<J>,
    service: Arc<InvoiceGenerationService<S, B>>,
) where
    J: JobStore + Clone + 'static,
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    let svc = service.clone();
    executor.register_handler(GENERATE_FINANCER_INVOICE, move |job| {
        let payload: GenerateFinancerInvoicePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobResult::Failure(format!("invalid payload: {e}")),
        };
        outcome(
            job,
            svc.generate_financer_invoice(job.tenant_id, payload.financer_id, &payload.month_year, payload.batch_id),
        )
    });

    let svc = service.clone();
    executor.register_handler(GENERATE_DIVISION_INVOICE, move |job| {
        let payload: GenerateDivisionInvoicePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobResult::Failure(format!("invalid payload: {e}")),
        };
        outcome(
            job,
            svc.generate_division_invoice(
                job.tenant_id,
                payload.division_id,
                &payload.financer_ids,
                &payload.month_year,
                payload.batch_id,
            ),
        )
    });

    let svc = service.clone();
    executor.register_handler(RECORD_GENERATION_FAILURE, move |job| {
        let payload: RecordGenerationFailurePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobResult::Failure(format!("invalid payload: {e}")),
        };
        match svc.record_failure(job.tenant_id, payload.batch_id, payload.entity_id, &payload.error) {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Failure(e.to_string()),
        }
    });

    let svc = service.clone();
    executor.register_handler(RECORD_INVOICE_PAYMENT, move |job| {
        let payload: RecordInvoicePaymentPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobResult::Failure(format!("invalid payload: {e}")),
        };
        let loaded = svc
            .dispatcher()
            .load(job.tenant_id, payload.invoice_id.0, |_, id| Invoice::empty(InvoiceId(id)));
        match loaded {
            Ok(Some(invoice)) => match svc.record_payment(job.tenant_id, &invoice, payload.amount) {
                Ok(()) => JobResult::Success,
                Err(e) => JobResult::Failure(e.to_string()),
            },
            Ok(None) => JobResult::Failure(format!("invoice {} not found", payload.invoice_id.0)),
            Err(e) => JobResult::Failure(e.to_string()),
        }
    });

    let jobs = executor.store().clone();
    executor.on_dead_letter("invoicing.*", move |job, last_error| {
        if job.kind.type_name() == RECORD_GENERATION_FAILURE {
            error!(job_id = %job.id, "batch failure could not be recorded; retry it from the dead letters");
            return;
        }
        let Some((batch_id, entity_id)) = job_target(job) else {
            return;
        };
        let Err(e) = service.record_failure(job.tenant_id, batch_id, entity_id, last_error) else {
            return;
        };

        warn!(job_id = %job.id, %batch_id, error = %e, "recording generation failure deferred to a job");
        let payload = RecordGenerationFailurePayload { batch_id, entity_id, error: last_error.to_string() };
        let queued = record_failure_job(job.tenant_id, &payload)
            .map_err(|e| e.to_string())
            .and_then(|deferred| jobs.enqueue(deferred).map_err(|e| e.to_string()));
        match queued {
            Ok(deferred_id) => info!(job_id = %job.id, %deferred_id, %batch_id, "generation failure queued for the batch"),
            Err(e) => error!(job_id = %job.id, %batch_id, error = %e, "failed to queue generation failure for the batch"),
        }
    });
}
