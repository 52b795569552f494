//! Monthly invoice generation batch.
//!
//! A batch is started with the number of invoices it expects and then records
//! one outcome per entity (division or financer). Counts only ever grow and
//! never exceed the total; the batch completes in the same decision that
//! records its last outcome.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use engage_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use engage_events::{Command, Event};
use engage_organizations::DivisionId;

use crate::invoice::InvoiceId;
use crate::period::BillingPeriod;

/// Batch identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub AggregateId);

impl BatchId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
}

/// Aggregate root: InvoiceGeneration (one monthly batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceGeneration {
    id: BatchId,
    tenant_id: Option<TenantId>,
    month_year: String,
    division_id: Option<DivisionId>,
    total: u32,
    completed: u32,
    failed: u32,
    skipped: u32,
    processed: BTreeSet<AggregateId>,
    status: BatchStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl InvoiceGeneration {
    pub fn empty(id: BatchId) -> Self {
        Self {
            id,
            tenant_id: None,
            month_year: String::new(),
            division_id: None,
            total: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            processed: BTreeSet::new(),
            status: BatchStatus::Running,
            started_at: None,
            completed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> BatchId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_started(&self) -> bool {
        self.created
    }

    pub fn month_year(&self) -> &str {
        &self.month_year
    }

    pub fn division_id(&self) -> Option<DivisionId> {
        self.division_id
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Entities with a recorded outcome.
    pub fn processed(&self) -> u32 {
        self.completed + self.failed + self.skipped
    }

    pub fn has_processed(&self, entity_id: AggregateId) -> bool {
        self.processed.contains(&entity_id)
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl AggregateRoot for InvoiceGeneration {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: StartBatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBatch {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub month_year: String,
    pub total: u32,
    pub division_id: Option<DivisionId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordInvoiceCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInvoiceCompleted {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub entity_id: AggregateId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordInvoiceFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInvoiceFailed {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub entity_id: AggregateId,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordInvoiceSkipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInvoiceSkipped {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub entity_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceGenerationCommand {
    StartBatch(StartBatch),
    RecordInvoiceCompleted(RecordInvoiceCompleted),
    RecordInvoiceFailed(RecordInvoiceFailed),
    RecordInvoiceSkipped(RecordInvoiceSkipped),
}

impl Command for InvoiceGenerationCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        let id = match self {
            InvoiceGenerationCommand::StartBatch(c) => c.batch_id,
            InvoiceGenerationCommand::RecordInvoiceCompleted(c) => c.batch_id,
            InvoiceGenerationCommand::RecordInvoiceFailed(c) => c.batch_id,
            InvoiceGenerationCommand::RecordInvoiceSkipped(c) => c.batch_id,
        };
        id.0
    }
}

/// Event: BatchStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStarted {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub month_year: String,
    pub total: u32,
    pub division_id: Option<DivisionId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCompleted {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub entity_id: AggregateId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFailed {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub entity_id: AggregateId,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceSkipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSkipped {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub entity_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchCompleted (final counts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCompleted {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceGenerationEvent {
    BatchStarted(BatchStarted),
    InvoiceCompleted(InvoiceCompleted),
    InvoiceFailed(InvoiceFailed),
    InvoiceSkipped(InvoiceSkipped),
    BatchCompleted(BatchCompleted),
}

impl Event for InvoiceGenerationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceGenerationEvent::BatchStarted(_) => "invoicing.generation_batch.started",
            InvoiceGenerationEvent::InvoiceCompleted(_) => "invoicing.generation_batch.invoice_completed",
            InvoiceGenerationEvent::InvoiceFailed(_) => "invoicing.generation_batch.invoice_failed",
            InvoiceGenerationEvent::InvoiceSkipped(_) => "invoicing.generation_batch.invoice_skipped",
            InvoiceGenerationEvent::BatchCompleted(_) => "invoicing.generation_batch.completed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceGenerationEvent::BatchStarted(e) => e.occurred_at,
            InvoiceGenerationEvent::InvoiceCompleted(e) => e.occurred_at,
            InvoiceGenerationEvent::InvoiceFailed(e) => e.occurred_at,
            InvoiceGenerationEvent::InvoiceSkipped(e) => e.occurred_at,
            InvoiceGenerationEvent::BatchCompleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InvoiceGeneration {
    type Command = InvoiceGenerationCommand;
    type Event = InvoiceGenerationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceGenerationEvent::BatchStarted(e) => {
                self.id = e.batch_id;
                self.tenant_id = Some(e.tenant_id);
                self.month_year = e.month_year.clone();
                self.division_id = e.division_id;
                self.total = e.total;
                self.status = BatchStatus::Running;
                self.started_at = Some(e.occurred_at);
                self.created = true;
            }
            InvoiceGenerationEvent::InvoiceCompleted(e) => {
                if self.processed.insert(e.entity_id) {
                    self.completed += 1;
                }
            }
            InvoiceGenerationEvent::InvoiceFailed(e) => {
                if self.processed.insert(e.entity_id) {
                    self.failed += 1;
                }
            }
            InvoiceGenerationEvent::InvoiceSkipped(e) => {
                if self.processed.insert(e.entity_id) {
                    self.skipped += 1;
                }
            }
            InvoiceGenerationEvent::BatchCompleted(e) => {
                self.status = BatchStatus::Completed;
                self.completed_at = Some(e.occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceGenerationCommand::StartBatch(cmd) => self.handle_start(cmd),
            InvoiceGenerationCommand::RecordInvoiceCompleted(cmd) => self.decide_record(
                cmd.tenant_id,
                cmd.batch_id,
                cmd.entity_id,
                cmd.occurred_at,
                InvoiceGenerationEvent::InvoiceCompleted(InvoiceCompleted {
                    tenant_id: cmd.tenant_id,
                    batch_id: cmd.batch_id,
                    entity_id: cmd.entity_id,
                    invoice_id: cmd.invoice_id,
                    occurred_at: cmd.occurred_at,
                }),
            ),
            InvoiceGenerationCommand::RecordInvoiceFailed(cmd) => self.decide_record(
                cmd.tenant_id,
                cmd.batch_id,
                cmd.entity_id,
                cmd.occurred_at,
                InvoiceGenerationEvent::InvoiceFailed(InvoiceFailed {
                    tenant_id: cmd.tenant_id,
                    batch_id: cmd.batch_id,
                    entity_id: cmd.entity_id,
                    error: cmd.error.clone(),
                    occurred_at: cmd.occurred_at,
                }),
            ),
            InvoiceGenerationCommand::RecordInvoiceSkipped(cmd) => self.decide_record(
                cmd.tenant_id,
                cmd.batch_id,
                cmd.entity_id,
                cmd.occurred_at,
                InvoiceGenerationEvent::InvoiceSkipped(InvoiceSkipped {
                    tenant_id: cmd.tenant_id,
                    batch_id: cmd.batch_id,
                    entity_id: cmd.entity_id,
                    reason: cmd.reason.clone(),
                    occurred_at: cmd.occurred_at,
                }),
            ),
        }
    }
}

impl InvoiceGeneration {
    fn handle_start(&self, cmd: &StartBatch) -> Result<Vec<InvoiceGenerationEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("generation batch already started"));
        }
        let period = BillingPeriod::from_month_year(&cmd.month_year)?;

        let mut events = vec![InvoiceGenerationEvent::BatchStarted(BatchStarted {
            tenant_id: cmd.tenant_id,
            batch_id: cmd.batch_id,
            month_year: period.month_year(),
            total: cmd.total,
            division_id: cmd.division_id,
            occurred_at: cmd.occurred_at,
        })];

        // Nothing to generate: the batch is done as soon as it starts.
        if cmd.total == 0 {
            events.push(InvoiceGenerationEvent::BatchCompleted(BatchCompleted {
                tenant_id: cmd.tenant_id,
                batch_id: cmd.batch_id,
                completed: 0,
                failed: 0,
                skipped: 0,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn decide_record(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        entity_id: AggregateId,
        occurred_at: DateTime<Utc>,
        outcome: InvoiceGenerationEvent,
    ) -> Result<Vec<InvoiceGenerationEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != batch_id {
            return Err(DomainError::invariant("batch_id mismatch"));
        }
        if self.processed.contains(&entity_id) {
            return Ok(vec![]);
        }
        if self.status == BatchStatus::Completed {
            return Err(DomainError::invariant("generation batch is already completed"));
        }
        if self.processed() >= self.total {
            return Err(DomainError::invariant("generation batch counts would exceed total"));
        }

        let (mut completed, mut failed, mut skipped) = (self.completed, self.failed, self.skipped);
        match &outcome {
            InvoiceGenerationEvent::InvoiceCompleted(_) => completed += 1,
            InvoiceGenerationEvent::InvoiceFailed(_) => failed += 1,
            InvoiceGenerationEvent::InvoiceSkipped(_) => skipped += 1,
            _ => return Err(DomainError::invariant("unexpected batch outcome")),
        }

        let mut events = vec![outcome];
        if completed + failed + skipped == self.total {
            events.push(InvoiceGenerationEvent::BatchCompleted(BatchCompleted {
                tenant_id,
                batch_id,
                completed,
                failed,
                skipped,
                occurred_at,
            }));
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_events::execute;
    use proptest::prelude::*;

    fn started(total: u32) -> (InvoiceGeneration, TenantId, BatchId) {
        let tenant_id = TenantId::new();
        let batch_id = BatchId::generate();
        let mut batch = InvoiceGeneration::empty(batch_id);
        execute(
            &mut batch,
            &InvoiceGenerationCommand::StartBatch(StartBatch {
                tenant_id,
                batch_id,
                month_year: "2025-03".to_string(),
                total,
                division_id: None,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        (batch, tenant_id, batch_id)
    }

    fn complete(tenant_id: TenantId, batch_id: BatchId, entity_id: AggregateId) -> InvoiceGenerationCommand {
        InvoiceGenerationCommand::RecordInvoiceCompleted(RecordInvoiceCompleted {
            tenant_id,
            batch_id,
            entity_id,
            invoice_id: InvoiceId::generate(),
            occurred_at: Utc::now(),
        })
    }

    fn fail(tenant_id: TenantId, batch_id: BatchId, entity_id: AggregateId) -> InvoiceGenerationCommand {
        InvoiceGenerationCommand::RecordInvoiceFailed(RecordInvoiceFailed {
            tenant_id,
            batch_id,
            entity_id,
            error: "boom".to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn skip(tenant_id: TenantId, batch_id: BatchId, entity_id: AggregateId) -> InvoiceGenerationCommand {
        InvoiceGenerationCommand::RecordInvoiceSkipped(RecordInvoiceSkipped {
            tenant_id,
            batch_id,
            entity_id,
            reason: "no active beneficiaries".to_string(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn last_outcome_completes_the_batch_in_the_same_decision() {
        let (mut batch, tenant_id, batch_id) = started(3);

        execute(&mut batch, &complete(tenant_id, batch_id, AggregateId::new())).unwrap();
        execute(&mut batch, &skip(tenant_id, batch_id, AggregateId::new())).unwrap();
        assert_eq!(batch.status(), BatchStatus::Running);

        let events = execute(&mut batch, &fail(tenant_id, batch_id, AggregateId::new())).unwrap();
        assert_eq!(events.len(), 2);
        match &events[1] {
            InvoiceGenerationEvent::BatchCompleted(e) => {
                assert_eq!((e.completed, e.failed, e.skipped), (1, 1, 1));
            }
            _ => panic!("Expected BatchCompleted event"),
        }
        assert_eq!(batch.status(), BatchStatus::Completed);
        assert!(batch.completed_at().is_some());
    }

    #[test]
    fn recording_the_same_entity_twice_is_a_no_op() {
        let (mut batch, tenant_id, batch_id) = started(2);
        let entity = AggregateId::new();

        execute(&mut batch, &complete(tenant_id, batch_id, entity)).unwrap();
        let events = execute(&mut batch, &fail(tenant_id, batch_id, entity)).unwrap();
        assert!(events.is_empty());
        assert_eq!(batch.completed(), 1);
        assert_eq!(batch.failed(), 0);
    }

    #[test]
    fn zero_total_starts_completed() {
        let (batch, tenant_id, batch_id) = started(0);
        assert_eq!(batch.status(), BatchStatus::Completed);
        assert_eq!(batch.version(), 2);

        let err = batch.handle(&complete(tenant_id, batch_id, AggregateId::new())).unwrap_err();
        match err {
            DomainError::InvariantViolation(msg) if msg.contains("already completed") => {}
            other => panic!("Expected InvariantViolation, got {other:?}"),
        }
    }

    #[test]
    fn invalid_month_is_rejected() {
        let batch_id = BatchId::generate();
        let err = InvoiceGeneration::empty(batch_id)
            .handle(&InvoiceGenerationCommand::StartBatch(StartBatch {
                tenant_id: TenantId::new(),
                batch_id,
                month_year: "2025-13".to_string(),
                total: 1,
                division_id: None,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn recording_on_unknown_batch_is_not_found() {
        let batch_id = BatchId::generate();
        let err = InvoiceGeneration::empty(batch_id)
            .handle(&complete(TenantId::new(), batch_id, AggregateId::new()))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    proptest! {
        #[test]
        fn counts_are_monotonic_and_bounded(total in 1u32..12, outcomes in proptest::collection::vec((0u8..3, 0usize..16), 0..40)) {
            let (mut batch, tenant_id, batch_id) = started(total);
            let entities: Vec<AggregateId> = (0..16).map(|_| AggregateId::new()).collect();
            let mut last = 0;

            for (kind, idx) in outcomes {
                let entity = entities[idx];
                let cmd = match kind {
                    0 => complete(tenant_id, batch_id, entity),
                    1 => fail(tenant_id, batch_id, entity),
                    _ => skip(tenant_id, batch_id, entity),
                };
                let _ = execute(&mut batch, &cmd);

                prop_assert!(batch.processed() >= last);
                prop_assert!(batch.processed() <= batch.total());
                prop_assert_eq!(batch.status() == BatchStatus::Completed, batch.processed() == total);
                last = batch.processed();
            }
        }
    }
}
