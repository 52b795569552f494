//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the stream (tenant-scoped) and check it
//!   ↓
//! 2. Rehydrate the aggregate
//!   ↓
//! 3. Handle the command (pure decision)
//!   ↓
//! 4. Append with ExpectedVersion::Exact(current revision)
//!   ↓
//! 5. Publish the committed envelopes
//! ```
//!
//! Publication happens strictly after a successful append. If publishing
//! fails the events are already durable, so delivery is at-least-once.
//! Append and publish run under one gate, so subscribers of a dispatcher see
//! each stream in commit order.
//!
//! Background writers that share streams (generation jobs all report to one
//! batch and one division ledger) use [`CommandDispatcher::dispatch_with_retry`],
//! which reloads and decides again after a `Concurrency` conflict.

use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use engage_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use engage_events::{Command, EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Stale stream revision: someone appended in between.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Domain-level conflict (duplicate enrollment, etc.).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    /// A stored payload no longer matches the aggregate's event type.
    #[error("event deserialization failed: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventStoreError),

    /// Append succeeded, publication did not.
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Conflict(msg),
            DomainError::Unauthorized => DispatchError::Unauthorized,
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Reusable command engine over any `EventStore` and `EventBus`.
///
/// Aggregates must be deterministic: the same history always rebuilds the same
/// state, and `apply` bumps the version once per event.
/// Attempts [`CommandDispatcher::dispatch_with_retry`] makes before giving up
/// on a contended stream.
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 32;

#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    commit_gate: Mutex<()>,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus, commit_gate: Mutex::new(()) }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Run one command against one stream and return the committed events.
    ///
    /// A command that decides no events (idempotent replays, no-op updates)
    /// returns an empty vector and touches neither store nor bus.
    pub fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: engage_events::Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            tracing::debug!(%tenant_id, %aggregate_id, "command decided no events");
            return Ok(vec![]);
        }

        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(tenant_id, aggregate_id, aggregate_type.clone(), Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = {
            let _gate = self.commit_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let committed = self.store.append(uncommitted, expected)?;
            for stored in &committed {
                self.bus
                    .publish(stored.to_envelope())
                    .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
            }
            committed
        };

        tracing::debug!(
            %tenant_id,
            %aggregate_id,
            aggregate_type = %aggregate_type,
            committed = committed.len(),
            "command dispatched"
        );
        Ok(committed)
    }

    /// `dispatch` for commands that know their own stream.
    pub fn dispatch_targeted<A>(
        &self,
        tenant_id: TenantId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: engage_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = command.target_aggregate_id();
        self.dispatch(tenant_id, aggregate_id, aggregate_type, command, make_aggregate)
    }

    /// `dispatch_targeted` that survives other writers on the same stream.
    ///
    /// On `Concurrency` the stream is reloaded and the command decided again,
    /// up to `max_attempts` tries in total. Only commands whose aggregate
    /// ignores a repeat (same invoice, same batch entity) belong here.
    pub fn dispatch_with_retry<A>(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl Fn(TenantId, AggregateId) -> A,
        max_attempts: u32,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command + Clone,
        A::Event: engage_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = command.target_aggregate_id();
        let mut attempt = 1;
        loop {
            match self.dispatch(tenant_id, aggregate_id, aggregate_type, command.clone(), &make_aggregate) {
                Err(DispatchError::Concurrency(msg)) if attempt < max_attempts.max(1) => {
                    tracing::debug!(%tenant_id, %aggregate_id, attempt, conflict = %msg, "stream moved, deciding again");
                    attempt += 1;
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }

    /// Rehydrated aggregate, or `None` when the stream is empty.
    pub fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Option<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        if history.is_empty() {
            return Ok(None);
        }
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;
        Ok(Some(aggregate))
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

/// Tenant, aggregate and ordering checks on a loaded stream, in case a
/// backend returns rows it should not have.
fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number == 0 {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                "stored event has sequence_number=0".to_string(),
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(format!("{} #{}: {e}", stored.event_type, stored.sequence_number)))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
