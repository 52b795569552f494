//! Monthly run: plan one job per division and per financer, start the batch,
//! enqueue the jobs.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use engage_core::{AggregateId, DomainError, TenantId};
use engage_events::{EventBus, EventEnvelope};
use engage_invoicing::{BatchId, BillingPeriod};
use engage_organizations::{DivisionId, FinancerId};

use super::jobs::{
    GenerateDivisionInvoicePayload, GenerateFinancerInvoicePayload, GenerationJobConfig, division_job, financer_job,
};
use super::service::InvoiceGenerationService;
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;
use crate::jobs::{Job, JobStore, JobStoreError};
use crate::projections::organizations::{DivisionReadModel, FinancerReadModel, OrganizationDirectoryProjection};
use crate::read_model::TenantStore;

pub const DUPLICATE_REASON: &str = "duplicate";

/// Where a run finds the divisions to bill and their financers.
pub trait OrganizationDirectory: Send + Sync {
    fn division(&self, tenant_id: TenantId, division_id: &DivisionId) -> Option<DivisionReadModel>;

    /// Each division with its `financer_ids` filled.
    fn divisions(&self, tenant_id: TenantId) -> Vec<DivisionReadModel>;
}

impl<D, F> OrganizationDirectory for OrganizationDirectoryProjection<D, F>
where
    D: TenantStore<DivisionId, DivisionReadModel>,
    F: TenantStore<FinancerId, FinancerReadModel>,
{
    fn division(&self, tenant_id: TenantId, division_id: &DivisionId) -> Option<DivisionReadModel> {
        OrganizationDirectoryProjection::division(self, tenant_id, division_id)
    }

    fn divisions(&self, tenant_id: TenantId) -> Vec<DivisionReadModel> {
        OrganizationDirectoryProjection::divisions(self, tenant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyRunSummary {
    pub batch_id: BatchId,
    pub month_year: String,
    pub divisions: usize,
    pub jobs_enqueued: usize,
    pub duplicates: usize,
}

#[derive(Debug, Error)]
pub enum MonthlyRunError {
    #[error(transparent)]
    InvalidMonth(#[from] DomainError),

    #[error("division {0} not found")]
    DivisionNotFound(DivisionId),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error("failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct MonthlyInvoiceRun<S, B> {
    service: Arc<InvoiceGenerationService<S, B>>,
    jobs: Arc<dyn JobStore>,
    directory: Arc<dyn OrganizationDirectory>,
    config: GenerationJobConfig,
}

impl<S, B> MonthlyInvoiceRun<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        service: Arc<InvoiceGenerationService<S, B>>,
        jobs: Arc<dyn JobStore>,
        directory: Arc<dyn OrganizationDirectory>,
        config: GenerationJobConfig,
    ) -> Self {
        Self { service, jobs, directory, config }
    }

    pub fn start(
        &self,
        tenant_id: TenantId,
        month_year: &str,
        division_filter: Option<DivisionId>,
    ) -> Result<MonthlyRunSummary, MonthlyRunError> {
        let month_year = BillingPeriod::from_month_year(month_year)?.month_year();

        let divisions = match division_filter {
            Some(id) => vec![self.directory.division(tenant_id, &id).ok_or(MonthlyRunError::DivisionNotFound(id))?],
            None => self.directory.divisions(tenant_id),
        };

        let batch_id = BatchId::generate();
        let mut planned: Vec<(AggregateId, Job)> = Vec::new();
        for division in &divisions {
            let payload = GenerateDivisionInvoicePayload {
                batch_id,
                division_id: division.division_id,
                financer_ids: division.financer_ids.clone(),
                month_year: month_year.clone(),
            };
            planned.push((division.division_id.0, division_job(tenant_id, &payload, &self.config)?));

            for financer_id in &division.financer_ids {
                let payload =
                    GenerateFinancerInvoicePayload { batch_id, financer_id: *financer_id, month_year: month_year.clone() };
                planned.push((financer_id.0, financer_job(tenant_id, &payload, &self.config)?));
            }
        }

        let total = u32::try_from(planned.len())
            .map_err(|_| DomainError::validation("too many invoices for one batch"))?;
        self.service.start_batch(tenant_id, batch_id, &month_year, total, division_filter)?;

        let (mut jobs_enqueued, mut duplicates) = (0, 0);
        for (entity_id, job) in planned {
            match self.jobs.enqueue(job) {
                Ok(_) => jobs_enqueued += 1,
                Err(JobStoreError::AlreadyExists(existing)) => {
                    warn!(%tenant_id, %batch_id, %entity_id, existing_job = %existing, "generation job already queued");
                    self.service.record_skip(tenant_id, batch_id, entity_id, DUPLICATE_REASON)?;
                    duplicates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(%tenant_id, %batch_id, %month_year, divisions = divisions.len(), jobs_enqueued, duplicates, "monthly invoice run started");
        Ok(MonthlyRunSummary { batch_id, month_year, divisions: divisions.len(), jobs_enqueued, duplicates })
    }
}
