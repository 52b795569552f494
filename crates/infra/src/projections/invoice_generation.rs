//! Batch progress read model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use engage_core::{AggregateId, TenantId};
use engage_events::EventEnvelope;
use engage_invoicing::{BatchId, BatchStatus, InvoiceGenerationEvent};
use engage_organizations::DivisionId;

use super::cursor::{StreamCursors, decode, ensure_stream};
use super::{Projection, ProjectionError};
use crate::read_model::TenantStore;

pub const BATCH_AGGREGATE_TYPE: &str = "invoicing.generation_batch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    pub entity_id: AggregateId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReadModel {
    pub batch_id: BatchId,
    pub month_year: String,
    pub division_id: Option<DivisionId>,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub status: BatchStatus,
    pub errors: Vec<BatchError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchReadModel {
    pub fn processed(&self) -> u32 {
        self.completed + self.failed + self.skipped
    }

    pub fn is_completed(&self) -> bool {
        self.status == BatchStatus::Completed
    }

    /// Counts only grow and never pass `total`; reaching it completes the batch.
    fn record(&mut self, outcome: Outcome, at: DateTime<Utc>) {
        if self.processed() >= self.total {
            return;
        }
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
        if self.processed() >= self.total {
            self.mark_completed(at);
        }
    }

    fn mark_completed(&mut self, at: DateTime<Utc>) {
        if self.status != BatchStatus::Completed {
            self.status = BatchStatus::Completed;
            self.completed_at = Some(at);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug)]
pub struct InvoiceGenerationProjection<S>
where
    S: TenantStore<BatchId, BatchReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> InvoiceGenerationProjection<S>
where
    S: TenantStore<BatchId, BatchReadModel>,
{
    pub fn new(store: S) -> Self {
        Self { store, cursors: StreamCursors::new() }
    }

    pub fn get(&self, tenant_id: TenantId, batch_id: &BatchId) -> Option<BatchReadModel> {
        self.store.get(tenant_id, batch_id)
    }

    /// Newest first.
    pub fn list(&self, tenant_id: TenantId) -> Vec<BatchReadModel> {
        let mut rows = self.store.list(tenant_id);
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.batch_id.cmp(&a.batch_id)));
        rows
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != BATCH_AGGREGATE_TYPE {
            return Ok(());
        }
        if !self.cursors.admit(envelope)? {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let ev: InvoiceGenerationEvent = decode(envelope)?;

        match ev {
            InvoiceGenerationEvent::BatchStarted(e) => {
                ensure_stream(envelope, e.tenant_id, e.batch_id.0)?;
                self.store.upsert(
                    tenant_id,
                    e.batch_id,
                    BatchReadModel {
                        batch_id: e.batch_id,
                        month_year: e.month_year,
                        division_id: e.division_id,
                        total: e.total,
                        completed: 0,
                        failed: 0,
                        skipped: 0,
                        status: BatchStatus::Running,
                        errors: Vec::new(),
                        started_at: e.occurred_at,
                        completed_at: None,
                    },
                );
            }
            InvoiceGenerationEvent::InvoiceCompleted(e) => {
                ensure_stream(envelope, e.tenant_id, e.batch_id.0)?;
                self.update(tenant_id, e.batch_id, |rm| rm.record(Outcome::Completed, e.occurred_at));
            }
            InvoiceGenerationEvent::InvoiceFailed(e) => {
                ensure_stream(envelope, e.tenant_id, e.batch_id.0)?;
                self.update(tenant_id, e.batch_id, |rm| {
                    rm.errors.push(BatchError { entity_id: e.entity_id, error: e.error.clone() });
                    rm.record(Outcome::Failed, e.occurred_at);
                });
            }
            InvoiceGenerationEvent::InvoiceSkipped(e) => {
                ensure_stream(envelope, e.tenant_id, e.batch_id.0)?;
                self.update(tenant_id, e.batch_id, |rm| rm.record(Outcome::Skipped, e.occurred_at));
            }
            InvoiceGenerationEvent::BatchCompleted(e) => {
                ensure_stream(envelope, e.tenant_id, e.batch_id.0)?;
                self.update(tenant_id, e.batch_id, |rm| rm.mark_completed(e.occurred_at));
            }
        }

        self.cursors.advance(tenant_id, envelope.aggregate_id(), envelope.sequence_number());
        Ok(())
    }

    fn update(&self, tenant_id: TenantId, batch_id: BatchId, f: impl FnOnce(&mut BatchReadModel)) {
        if let Some(mut rm) = self.store.get(tenant_id, &batch_id) {
            f(&mut rm);
            self.store.upsert(tenant_id, batch_id, rm);
        }
    }
}

impl<S> Projection for InvoiceGenerationProjection<S>
where
    S: TenantStore<BatchId, BatchReadModel>,
{
    fn name(&self) -> &'static str {
        "invoicing.generation_batches"
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        InvoiceGenerationProjection::apply_envelope(self, envelope)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        self.store.clear_tenant(tenant_id);
        self.cursors.clear_tenant(tenant_id);
    }
}
