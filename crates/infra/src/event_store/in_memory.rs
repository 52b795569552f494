use std::collections::BTreeMap;
use std::sync::RwLock;

use engage_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

type StreamKey = (TenantId, AggregateId);

/// Process-local event store for tests, demos and the in-memory backend.
///
/// Streams are kept in a `BTreeMap` so `load_all` comes out in
/// (tenant, aggregate, sequence) order without sorting.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<BTreeMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().map(|s| s.len()).unwrap_or(0)
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Backend("event store lock poisoned".to_string())
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some((tenant_id, aggregate_id, aggregate_type)) = validate_batch(&events)? else {
            return Ok(vec![]);
        };
        let aggregate_type = aggregate_type.to_string();

        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        let stream = streams.entry((tenant_id, aggregate_id)).or_default();
        let current = stream.last().map(|e| e.sequence_number).unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, sequence_number)| StoredEvent {
                event_id: e.event_id,
                tenant_id: e.tenant_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            })
            .collect();

        stream.extend(committed.iter().cloned());
        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(streams.get(&(tenant_id, aggregate_id)).cloned().unwrap_or_default())
    }

    fn load_all(&self, tenant_id: Option<TenantId>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(streams
            .iter()
            .filter(|((t, _), _)| tenant_id.is_none_or(|wanted| *t == wanted))
            .flat_map(|(_, events)| events.iter().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(tenant_id: TenantId, aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "invoicing.invoice.issued".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn sequence_numbers_continue_across_appends() {
        let store = InMemoryEventStore::new();
        let (t, a) = (TenantId::new(), AggregateId::new());

        let first = store
            .append(vec![event(t, a, "invoicing.invoice"), event(t, a, "invoicing.invoice")], ExpectedVersion::Exact(0))
            .unwrap();
        let second = store.append(vec![event(t, a, "invoicing.invoice")], ExpectedVersion::Exact(2)).unwrap();

        assert_eq!(first.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second[0].sequence_number, 3);
        assert_eq!(store.load_stream(t, a).unwrap().len(), 3);
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        let (t, a) = (TenantId::new(), AggregateId::new());
        store.append(vec![event(t, a, "x")], ExpectedVersion::Exact(0)).unwrap();

        let err = store.append(vec![event(t, a, "x")], ExpectedVersion::Exact(0)).unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn mixed_batches_and_type_changes_are_rejected() {
        let store = InMemoryEventStore::new();
        let (t, a) = (TenantId::new(), AggregateId::new());

        let err = store
            .append(vec![event(t, a, "x"), event(TenantId::new(), a, "x")], ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::TenantIsolation(_)));

        store.append(vec![event(t, a, "x")], ExpectedVersion::Any).unwrap();
        let err = store.append(vec![event(t, a, "y")], ExpectedVersion::Any).unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[test]
    fn streams_are_tenant_isolated_and_load_all_filters() {
        let store = InMemoryEventStore::new();
        let (t1, t2, a) = (TenantId::new(), TenantId::new(), AggregateId::new());
        store.append(vec![event(t1, a, "x")], ExpectedVersion::Any).unwrap();
        store.append(vec![event(t2, a, "x"), event(t2, a, "x")], ExpectedVersion::Any).unwrap();

        assert_eq!(store.load_stream(t1, a).unwrap().len(), 1);
        assert_eq!(store.load_all(Some(t2)).unwrap().len(), 2);
        assert_eq!(store.load_all(None).unwrap().len(), 3);
    }
}
