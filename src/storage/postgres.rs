//! # Postgres Event Store
//!
//! Reference relational adapter. The polling read and the lock-fetch share
//! one predicate over unprocessed events; the lock-fetch adds
//! `FOR UPDATE SKIP LOCKED` so concurrent workers skip held rows instead of
//! blocking on them, which is what makes horizontal scaling safe.
//!
//! The read query is kept cheap by a partial index over unprocessed rows
//! (see [`migrate`]); the table is expected to be overwhelmingly terminal
//! rows, so the index stays small regardless of total volume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::models::{Event, EventCandidate, NewEvent};
use crate::storage::{EventStore, EventTransaction};

/// DDL for the events table and its partial index.
///
/// Statements are idempotent; [`migrate`] runs them in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id VARCHAR NOT NULL PRIMARY KEY,
        "timestamp" TIMESTAMPTZ NOT NULL,
        event_type VARCHAR NOT NULL,
        data JSONB NOT NULL,
        correlation_id VARCHAR,
        handler_results JSONB NOT NULL DEFAULT '{}'::jsonb,
        errors INTEGER NOT NULL DEFAULT 0,
        backoff_until TIMESTAMPTZ,
        processed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_unprocessed_idx
        ON outbox_events ("timestamp")
        WHERE processed_at IS NULL
    "#,
];

const POLL_QUERY: &str = r#"
    SELECT id, errors
    FROM outbox_events
    WHERE processed_at IS NULL
      AND (backoff_until IS NULL OR backoff_until < NOW())
      AND errors < $1
    ORDER BY "timestamp" ASC
    LIMIT $2
"#;

const LOCK_QUERY: &str = r#"
    SELECT id, "timestamp", event_type, data, correlation_id,
           handler_results, errors, backoff_until, processed_at
    FROM outbox_events
    WHERE id = $1
      AND processed_at IS NULL
      AND (backoff_until IS NULL OR backoff_until < NOW())
      AND errors < $2
    FOR UPDATE SKIP LOCKED
"#;

const UPDATE_QUERY: &str = r#"
    UPDATE outbox_events
    SET handler_results = $2,
        errors = $3,
        backoff_until = $4,
        processed_at = $5
    WHERE id = $1
"#;

const INSERT_QUERY: &str = r#"
    INSERT INTO outbox_events (id, "timestamp", event_type, data, correlation_id)
    VALUES ($1, $2, $3, $4, $5)
"#;

/// Configuration for the Postgres adapter.
#[derive(Debug, Clone)]
pub struct PostgresEventStoreConfig {
    /// Cap on rows returned by one polling read.
    pub batch_size: i64,
}

impl Default for PostgresEventStoreConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// Postgres-backed [`EventStore`].
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    config: PostgresEventStoreConfig,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, PostgresEventStoreConfig::default())
    }

    pub fn with_config(pool: PgPool, config: PostgresEventStoreConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Create the events table and its partial index if they do not exist.
pub async fn migrate(pool: &PgPool) -> StorageResult<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn events_to_process(
        &self,
        max_errors: i32,
        cancel: &CancelToken,
    ) -> StorageResult<Vec<EventCandidate>> {
        let fetch = sqlx::query_as::<_, CandidateRow>(POLL_QUERY)
            .bind(max_errors)
            .bind(self.config.batch_size)
            .fetch_all(&self.pool);

        let rows = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            rows = fetch => rows.map_err(|e| {
                error!(error = %e, "polling read failed");
                StorageError::from(e)
            })?,
        };

        debug!(candidates = rows.len(), "polling read complete");
        Ok(rows
            .into_iter()
            .map(|row| EventCandidate {
                id: row.id,
                errors: row.errors,
            })
            .collect())
    }

    async fn begin(&self) -> StorageResult<Box<dyn EventTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl EventTransaction for PostgresTransaction {
    async fn lock_event(
        &mut self,
        id: &str,
        max_errors: i32,
        cancel: &CancelToken,
    ) -> StorageResult<Option<Event>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, EventRow>(LOCK_QUERY)
            .bind(id)
            .bind(max_errors)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Event::try_from).transpose()
    }

    async fn update_event(&mut self, event: &Event) -> StorageResult<()> {
        let handler_results = serde_json::to_value(&event.handler_results).map_err(|e| {
            StorageError::InvalidRecord {
                id: event.id.clone(),
                reason: format!("handler_results not serializable: {e}"),
            }
        })?;

        sqlx::query(UPDATE_QUERY)
            .bind(&event.id)
            .bind(handler_results)
            .bind(event.errors)
            .bind(event.backoff_until)
            .bind(event.processed_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_event(&mut self, event: NewEvent) -> StorageResult<()> {
        let result = sqlx::query(INSERT_QUERY)
            .bind(&event.id)
            .bind(event.timestamp)
            .bind(&event.event_type)
            .bind(&event.data)
            .bind(&event.correlation_id)
            .execute(&mut *self.tx)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateEvent(event.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.tx.commit().await.map_err(StorageError::from)
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        self.tx.rollback().await.map_err(StorageError::from)
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: String,
    errors: i32,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    timestamp: DateTime<Utc>,
    event_type: String,
    data: serde_json::Value,
    correlation_id: Option<String>,
    handler_results: serde_json::Value,
    errors: i32,
    backoff_until: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<EventRow> for Event {
    type Error = StorageError;

    fn try_from(row: EventRow) -> StorageResult<Event> {
        let handler_results = serde_json::from_value(row.handler_results).map_err(|e| {
            StorageError::InvalidRecord {
                id: row.id.clone(),
                reason: format!("handler_results column is not a result map: {e}"),
            }
        })?;

        Ok(Event {
            id: row.id,
            timestamp: row.timestamp,
            event_type: row.event_type,
            data: row.data,
            correlation_id: row.correlation_id,
            handler_results,
            errors: row.errors,
            backoff_until: row.backoff_until,
            processed_at: row.processed_at,
        })
    }
}
