//! Per-stream projection cursors.
//!
//! A cursor is the last sequence number a projection applied for one
//! `(tenant, aggregate)` stream. Replays at or below it are skipped; anything
//! other than `cursor + 1` above it is a gap.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use engage_core::{AggregateId, TenantId};
use engage_events::EventEnvelope;

use super::ProjectionError;

#[derive(Debug, Default)]
pub struct StreamCursors {
    inner: RwLock<HashMap<(TenantId, AggregateId), u64>>,
}

impl StreamCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: TenantId, aggregate_id: AggregateId) -> u64 {
        self.inner
            .read()
            .ok()
            .and_then(|c| c.get(&(tenant_id, aggregate_id)).copied())
            .unwrap_or(0)
    }

    /// `Ok(true)` when the envelope is the next one for its stream,
    /// `Ok(false)` when it was already applied.
    pub fn admit(&self, envelope: &EventEnvelope<JsonValue>) -> Result<bool, ProjectionError> {
        let last = self.get(envelope.tenant_id(), envelope.aggregate_id());
        let found = envelope.sequence_number();

        if found == 0 {
            return Err(ProjectionError::NonMonotonicSequence { last, found });
        }
        if found <= last {
            return Ok(false);
        }
        if found != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found });
        }
        Ok(true)
    }

    pub fn advance(&self, tenant_id: TenantId, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut cursors) = self.inner.write() {
            cursors.insert((tenant_id, aggregate_id), sequence_number);
        }
    }

    pub fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut cursors) = self.inner.write() {
            cursors.retain(|(t, _), _| *t != tenant_id);
        }
    }
}

/// Decode a payload into the aggregate's event enum.
pub fn decode<E: DeserializeOwned>(envelope: &EventEnvelope<JsonValue>) -> Result<E, ProjectionError> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| {
        ProjectionError::Deserialize(format!(
            "{} #{}: {e}",
            envelope.aggregate_type(),
            envelope.sequence_number()
        ))
    })
}

/// Reject an event whose tenant or id disagrees with its envelope.
pub fn ensure_stream(
    envelope: &EventEnvelope<JsonValue>,
    event_tenant: TenantId,
    event_aggregate: AggregateId,
) -> Result<(), ProjectionError> {
    if event_tenant != envelope.tenant_id() {
        return Err(ProjectionError::TenantIsolation(
            "event tenant_id does not match envelope tenant_id".to_string(),
        ));
    }
    if event_aggregate != envelope.aggregate_id() {
        return Err(ProjectionError::TenantIsolation(
            "event aggregate id does not match envelope aggregate_id".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn envelope(tenant_id: TenantId, aggregate_id: AggregateId, seq: u64) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(Uuid::now_v7(), tenant_id, aggregate_id, "x", seq, json!({}))
    }

    #[test]
    fn duplicates_skip_and_gaps_fail() {
        let cursors = StreamCursors::new();
        let (t, a) = (TenantId::new(), AggregateId::new());

        assert!(cursors.admit(&envelope(t, a, 1)).unwrap());
        cursors.advance(t, a, 1);
        assert!(!cursors.admit(&envelope(t, a, 1)).unwrap());
        assert!(cursors.admit(&envelope(t, a, 2)).unwrap());
        assert!(matches!(
            cursors.admit(&envelope(t, a, 4)),
            Err(ProjectionError::NonMonotonicSequence { last: 1, found: 4 })
        ));
        assert!(cursors.admit(&envelope(t, a, 0)).is_err());
    }

    #[test]
    fn clearing_a_tenant_resets_only_its_streams() {
        let cursors = StreamCursors::new();
        let (t1, t2, a) = (TenantId::new(), TenantId::new(), AggregateId::new());
        cursors.advance(t1, a, 3);
        cursors.advance(t2, a, 5);

        cursors.clear_tenant(t1);
        assert_eq!(cursors.get(t1, a), 0);
        assert_eq!(cursors.get(t2, a), 5);
    }
}
