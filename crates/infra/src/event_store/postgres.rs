//! Postgres-backed event store.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | `EventStoreError` |
//! |------------|---------------|-------------------|
//! | unique violation | `23505` | `Concurrency` (another writer took the sequence number) |
//! | check violation | `23514` | `InvalidAppend` |
//! | other database error | any | `InvalidAppend` |
//! | pool closed / io / tls | n/a | `Unavailable` |
//!
//! ## Runtime
//!
//! `EventStore` is synchronous. The store owns a current-thread tokio runtime
//! and blocks on it, so callers must not already be inside a tokio runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{instrument, Span};

use studio_core::{AgencyId, ExpectedVersion};

use super::r#trait::{
    validate_batch, EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent,
};

/// Schema for the event log and the game-state singleton.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    stream_id       UUID NOT NULL,
    stream_type     TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (stream_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS events_stream_type_idx ON events (stream_type, stream_id);

CREATE TABLE IF NOT EXISTS game_state (
    id         TEXT PRIMARY KEY,
    document   JSONB NOT NULL,
    version    BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresEventStore {
    /// Open a pool on `database_url` with a private runtime.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EventStoreError::Unavailable(format!("cannot start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }

    /// Create tables if they do not exist yet.
    pub fn migrate(&self) -> Result<(), EventStoreError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    async fn load_stream_async(&self, stream_id: AgencyId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                stream_id,
                stream_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload
            FROM events
            WHERE stream_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(stream_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let row = StoredEventRow::from_row(&row)
                .map_err(|e| EventStoreError::Corrupt(format!("failed to read event row: {e}")))?;
            stored.push(row.into());
        }
        Span::current().record("event_count", stored.len());
        Ok(stored)
    }

    #[instrument(skip(self, batch), fields(streams = batch.len()), err)]
    async fn append_batch_async(
        &self,
        batch: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // All expectations are checked inside the transaction before any insert.
        let mut starts = Vec::with_capacity(batch.len());
        for entry in &batch {
            let (current, existing_type) = check_stream_version(&mut tx, entry.stream_id).await?;

            if !entry.expected_version.matches(current) {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {current}",
                    entry.stream_id, entry.expected_version
                )));
            }
            if let (Some(existing), Some(incoming)) = (existing_type, entry.events.first()) {
                if existing != incoming.stream_type {
                    tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(EventStoreError::StreamTypeMismatch(format!(
                        "stream type is '{existing}', attempted append with '{}'",
                        incoming.stream_type
                    )));
                }
            }
            starts.push(current + 1);
        }

        let mut committed = Vec::new();
        for (entry, start) in batch.into_iter().zip(starts) {
            let mut next = start;
            for event in entry.events {
                insert_event(&mut tx, &event, next).await?;
                committed.push(StoredEvent {
                    event_id: event.event_id,
                    stream_id: event.stream_id,
                    stream_type: event.stream_type,
                    sequence_number: next,
                    event_type: event.event_type,
                    event_version: event.event_version,
                    occurred_at: event.occurred_at,
                    payload: event.payload,
                });
                next += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(committed)
    }

    async fn list_streams_async(&self, stream_type: &str) -> Result<Vec<AgencyId>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT stream_id
            FROM events
            WHERE stream_type = $1
            ORDER BY stream_id
            "#,
        )
        .bind(stream_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_streams", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("stream_id")
                    .map(AgencyId::from_uuid)
                    .map_err(|e| EventStoreError::Corrupt(format!("failed to read stream_id: {e}")))
            })
            .collect()
    }
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: AgencyId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(stream_type) AS stream_type
        FROM events
        WHERE stream_id = $1
        "#,
    )
    .bind(stream_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Corrupt(format!("failed to read current_version: {e}")))?;
    let stream_type: Option<String> = row
        .try_get("stream_type")
        .map_err(|e| EventStoreError::Corrupt(format!("failed to read stream_type: {e}")))?;

    Ok((current as u64, stream_type))
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &UncommittedEvent,
    sequence_number: u64,
) -> Result<(), EventStoreError> {
    sqlx::query(
        r#"
        INSERT INTO events (
            event_id,
            stream_id,
            stream_type,
            sequence_number,
            event_type,
            event_version,
            occurred_at,
            payload
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.event_id)
    .bind(event.stream_id.as_uuid())
    .bind(&event.stream_type)
    .bind(sequence_number as i64)
    .bind(&event.event_type)
    .bind(event.event_version as i32)
    .bind(event.occurred_at)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            EventStoreError::Concurrency(format!(
                "concurrent append detected on stream {}: sequence_number {sequence_number} already exists",
                event.stream_id
            ))
        } else {
            map_sqlx_error("insert_event", e)
        }
    })?;
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                _ => EventStoreError::InvalidAppend(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            EventStoreError::Unavailable(format!("{operation}: {err}"))
        }
        _ => EventStoreError::InvalidAppend(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    stream_id: uuid::Uuid,
    stream_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for StoredEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            stream_id: row.try_get("stream_id")?,
            stream_type: row.try_get("stream_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            stream_id: AgencyId::from_uuid(row.stream_id),
            stream_type: row.stream_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        let stream_id = first.stream_id;
        self.append_batch(vec![StreamAppend {
            stream_id,
            expected_version,
            events,
        }])
    }

    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(&batch)?;
        self.runtime.block_on(self.append_batch_async(batch))
    }

    fn load_stream(&self, stream_id: AgencyId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.runtime.block_on(self.load_stream_async(stream_id))
    }

    fn list_streams(&self, stream_type: &str) -> Result<Vec<AgencyId>, EventStoreError> {
        self.runtime.block_on(self.list_streams_async(stream_type))
    }
}
