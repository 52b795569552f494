//! Postgres-backed event store.
//!
//! SQLx errors map onto `EventStoreError` as follows:
//!
//! | SQLx error | Postgres code | `EventStoreError` |
//! |---|---|---|
//! | unique violation | `23505` | `Concurrency` (another writer took the sequence number) |
//! | check violation | `23514` | `InvalidAppend` |
//! | any other database error | | `Backend` |
//! | pool closed, I/O, decode | | `Backend` |

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use engage_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (tenant_id, aggregate_id, sequence_number)
)
"#;

const SELECT_COLUMNS: &str = "event_id, tenant_id, aggregate_id, aggregate_type, sequence_number, \
                              event_type, event_version, occurred_at, payload";

/// Append-only event store on a single `events` table.
///
/// Every query filters on `tenant_id`. Appends run in one transaction: read the
/// stream head, check `ExpectedVersion`, insert. A concurrent writer that wins
/// the race trips the `(tenant_id, aggregate_id, sequence_number)` unique key.
///
/// The `EventStore` trait is synchronous; calls are bridged onto the runtime
/// captured at construction.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool: Arc::new(pool), runtime }
    }

    /// Connect, capture the current runtime and create the table if missing.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool, Handle::current());
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id), err)]
    pub async fn load_stream_async(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM events \
             WHERE tenant_id = $1 AND aggregate_id = $2 ORDER BY sequence_number ASC"
        ))
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter().map(stored_event_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn load_all_async(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM events \
             WHERE ($1::uuid IS NULL OR tenant_id = $1) \
             ORDER BY tenant_id, aggregate_id, sequence_number"
        ))
        .bind(tenant_id.map(|t| *t.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all", e))?;

        rows.iter().map(stored_event_from_row).collect()
    }

    #[instrument(skip(self, events), fields(event_count = events.len(), expected_version = ?expected_version), err)]
    pub async fn append_async(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some((tenant_id, aggregate_id, aggregate_type)) = validate_batch(&events)? else {
            return Ok(vec![]);
        };
        let aggregate_type = aggregate_type.to_string();

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_type) = stream_head(&mut tx, tenant_id, aggregate_id).await?;

        if let Some(existing_type) = existing_type.filter(|t| *t != aggregate_type) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream aggregate_type is '{existing_type}', attempted append with '{aggregate_type}'"
            )));
        }

        if !expected_version.matches(current_version) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current_version}"
            )));
        }

        let mut committed = Vec::with_capacity(events.len());
        for (event, sequence_number) in events.into_iter().zip(current_version + 1..) {
            sqlx::query(
                "INSERT INTO events (event_id, tenant_id, aggregate_id, aggregate_type, sequence_number, \
                 event_type, event_version, occurred_at, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(event.event_id)
            .bind(tenant_id.as_uuid())
            .bind(aggregate_id.as_uuid())
            .bind(&aggregate_type)
            .bind(sequence_number as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            committed.push(StoredEvent {
                event_id: event.event_id,
                tenant_id: event.tenant_id,
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                sequence_number,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            });
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        tracing::debug!(%tenant_id, %aggregate_id, committed = committed.len(), "events appended");
        Ok(committed)
    }

    /// Run a future to completion from synchronous code.
    ///
    /// Inside a multi-threaded runtime the current worker is handed over with
    /// `block_in_place`; outside any runtime the captured handle drives it.
    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        if Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| self.runtime.block_on(fut))
        } else {
            self.runtime.block_on(fut)
        }
    }
}

async fn stream_head(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(sequence_number), 0) AS current_version, MAX(aggregate_type) AS aggregate_type \
         FROM events WHERE tenant_id = $1 AND aggregate_id = $2",
    )
    .bind(tenant_id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("stream_head", e))?;

    let current_version: i64 = row.try_get("current_version").map_err(|e| map_sqlx_error("stream_head", e))?;
    let aggregate_type: Option<String> = row.try_get("aggregate_type").map_err(|e| map_sqlx_error("stream_head", e))?;

    Ok((current_version as u64, aggregate_type))
}

fn stored_event_from_row(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let decode = |e| map_sqlx_error("decode_event_row", e);
    let sequence_number: i64 = row.try_get("sequence_number").map_err(decode)?;
    let event_version: i32 = row.try_get("event_version").map_err(decode)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(decode)?;

    Ok(StoredEvent {
        event_id: row.try_get("event_id").map_err(decode)?,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(decode)?),
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        sequence_number: sequence_number as u64,
        event_type: row.try_get("event_type").map_err(decode)?,
        event_version: event_version as u32,
        occurred_at,
        payload: row.try_get("payload").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Backend(format!("connection pool closed in {operation}")),
        other => EventStoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.block_on(self.append_async(events, expected_version))
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.block_on(self.load_stream_async(tenant_id, aggregate_id))
    }

    fn load_all(&self, tenant_id: Option<TenantId>) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.block_on(self.load_all_async(tenant_id))
    }
}
