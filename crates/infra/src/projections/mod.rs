//! Read model builders.
//!
//! Every projection here is:
//! - rebuildable from the event store (`rebuild_from_scratch`);
//! - tenant-isolated;
//! - idempotent under at-least-once delivery, through per-stream cursors.

use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use engage_core::TenantId;
use engage_events::EventEnvelope;

use crate::event_store::EventStore;

pub mod balances;
pub mod cursor;
pub mod invoice_generation;
pub mod invoices;
pub mod organizations;

pub use balances::{
    BalanceReadModel, CreditBalancesProjection, DivisionBalancesProjection,
};
pub use cursor::StreamCursors;
pub use invoice_generation::{BatchReadModel, InvoiceGenerationProjection};
pub use invoices::{InvoiceFilter, InvoiceReadModel, InvoicesProjection, Page, PageMeta, paginate};
pub use organizations::{DivisionReadModel, FinancerReadModel, OrganizationDirectoryProjection};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error("failed to load events: {0}")]
    Load(String),
}

/// Object-safe view of a projection, for fan-out and rebuilds.
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply one envelope; envelopes of other aggregate types are ignored.
    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError>;

    /// Forget the tenant's rows and cursors.
    fn clear_tenant(&self, tenant_id: TenantId);

    /// Clear the tenant, then replay its envelopes in stream order.
    /// Envelopes of other tenants are ignored.
    fn rebuild_from_scratch(
        &self,
        tenant_id: TenantId,
        envelopes: &[EventEnvelope<JsonValue>],
    ) -> Result<(), ProjectionError> {
        self.clear_tenant(tenant_id);

        let mut ordered: Vec<&EventEnvelope<JsonValue>> =
            envelopes.iter().filter(|e| e.tenant_id() == tenant_id).collect();
        ordered.sort_by_key(|e| (e.aggregate_id(), e.sequence_number()));

        for envelope in ordered {
            self.apply_envelope(envelope)?;
        }
        Ok(())
    }
}

/// The projections of one process, fed one envelope at a time.
///
/// Live delivery (bus workers, request handlers) and rebuilds all go through
/// here, so a projection never sees two envelopes concurrently.
pub struct ProjectionSet {
    projections: Vec<Arc<dyn Projection>>,
    gate: Mutex<()>,
}

impl ProjectionSet {
    pub fn new(projections: Vec<Arc<dyn Projection>>) -> Self {
        Self { projections, gate: Mutex::new(()) }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.projections.iter().map(|p| p.name()).collect()
    }

    /// Apply to every projection; the first failure is returned after all
    /// projections had their turn.
    pub fn apply(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        let _guard = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut first_error = None;
        for projection in &self.projections {
            if let Err(e) = projection.apply_envelope(envelope) {
                warn!(
                    projection = projection.name(),
                    aggregate_type = envelope.aggregate_type(),
                    sequence_number = envelope.sequence_number(),
                    error = %e,
                    "projection apply failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rebuild every projection for one tenant from the store. Returns the
    /// number of events replayed.
    pub fn rebuild<S: EventStore + ?Sized>(&self, store: &S, tenant_id: TenantId) -> Result<usize, ProjectionError> {
        let envelopes: Vec<_> = store
            .load_all(Some(tenant_id))
            .map_err(|e| ProjectionError::Load(e.to_string()))?
            .iter()
            .map(|e| e.to_envelope())
            .collect();

        let _guard = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for projection in &self.projections {
            projection.rebuild_from_scratch(tenant_id, &envelopes)?;
        }
        info!(%tenant_id, events = envelopes.len(), "projections rebuilt");
        Ok(envelopes.len())
    }
}

impl core::fmt::Debug for ProjectionSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionSet").field("projections", &self.names()).finish()
    }
}
