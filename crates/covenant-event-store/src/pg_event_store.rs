//! `PostgreSQL` implementation of the `EventStore` trait.
//!
//! Appends take a transaction-scoped advisory lock keyed by the aggregate id,
//! check the stream version, and insert the batch. The unique
//! `(aggregate_id, version)` constraint is the last line against a racing
//! writer; a unique violation is reported as a concurrency conflict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use covenant_core::error::DomainError;
use covenant_core::event::{StoredEvent, UncommittedEvent};
use covenant_core::store::{EventStore, Snapshot};

use crate::schema;

/// PostgreSQL-backed event store.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct EventRow {
    event_id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    version: i64,
    data: Value,
    metadata: Value,
    occurred_at: DateTime<Utc>,
    correlation_id: Option<Uuid>,
    causation_id: Option<Uuid>,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = DomainError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let metadata = match row.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            event_id: row.event_id,
            event_type: row.event_type,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            version: from_db_version(row.version)?,
            data: row.data,
            metadata,
            timestamp: row.occurred_at,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    aggregate_id: String,
    aggregate_type: String,
    version: i64,
    data: Value,
    taken_at: DateTime<Utc>,
}

fn db_error(e: sqlx::Error) -> DomainError {
    DomainError::EventSourcing(format!("database error: {e}"))
}

fn to_db_version(version: u64) -> Result<i64, DomainError> {
    i64::try_from(version)
        .map_err(|_| DomainError::Validation(format!("version {version} exceeds storage range")))
}

fn from_db_version(version: i64) -> Result<u64, DomainError> {
    u64::try_from(version)
        .map_err(|_| DomainError::EventSourcing(format!("negative stored version {version}")))
}

const EVENT_COLUMNS: &str = "event_id, aggregate_id, aggregate_type, event_type, version, data, \
                             metadata, occurred_at, correlation_id, causation_id";

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the event and snapshot tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `sqlx::Error` if the DDL cannot be executed.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(schema::CREATE_TABLES)
            .execute(&self.pool)
            .await
            .map(|_| ())
    }

    async fn locked_stream_state(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: &str,
    ) -> Result<(u64, Option<String>), DomainError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(aggregate_id)
            .execute(&mut **tx)
            .await
            .map_err(db_error)?;

        let (version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM covenant_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_error)?;

        let aggregate_type: Option<(String,)> = sqlx::query_as(
            "SELECT aggregate_type FROM covenant_events WHERE aggregate_id = $1 LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error)?;

        Ok((from_db_version(version)?, aggregate_type.map(|(t,)| t)))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let (actual, stream_type) = Self::locked_stream_state(&mut tx, aggregate_id).await?;

        if actual != expected_version {
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_owned(),
                expected: expected_version,
                actual,
            });
        }
        let Some(first) = events.first() else {
            return Ok(Vec::new());
        };
        let aggregate_type = stream_type.unwrap_or_else(|| first.aggregate_type.clone());
        if let Some(foreign) = events.iter().find(|e| e.aggregate_type != aggregate_type) {
            return Err(DomainError::Validation(format!(
                "event {} has aggregate type `{}` but stream {aggregate_id} holds `{aggregate_type}`",
                foreign.event_id, foreign.aggregate_type
            )));
        }

        let mut stored = Vec::with_capacity(events.len());
        for (event, version) in events.into_iter().zip(actual + 1..) {
            let event = StoredEvent::from_uncommitted(aggregate_id, version, event);
            let inserted = sqlx::query(
                "INSERT INTO covenant_events \
                 (event_id, aggregate_id, aggregate_type, event_type, version, data, metadata, \
                  occurred_at, correlation_id, causation_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(event.event_id)
            .bind(&event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(to_db_version(version)?)
            .bind(Json(&event.data))
            .bind(Json(&event.metadata))
            .bind(event.timestamp)
            .bind(event.correlation_id)
            .bind(event.causation_id)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => stored.push(event),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    return Err(DomainError::ConcurrencyConflict {
                        aggregate_id: aggregate_id.to_owned(),
                        expected: expected_version,
                        actual: version,
                    });
                }
                Err(e) => return Err(db_error(e)),
            }
        }

        tx.commit().await.map_err(db_error)?;
        debug!(aggregate_id, appended = stored.len(), "events appended");
        Ok(stored)
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM covenant_events \
             WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC"
        ))
        .bind(aggregate_id)
        .bind(to_db_version(from_version)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(StoredEvent::try_from).collect()
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM covenant_events \
             WHERE event_type = $1 AND ($2::timestamptz IS NULL OR occurred_at >= $2) \
             ORDER BY occurred_at ASC, aggregate_id ASC, version ASC"
        ))
        .bind(event_type)
        .bind(from_timestamp)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(StoredEvent::try_from).collect()
    }

    #[instrument(skip(self, snapshot), fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version), err)]
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let (stream_version, stream_type) =
            Self::locked_stream_state(&mut tx, &snapshot.aggregate_id).await?;

        if snapshot.version > stream_version {
            return Err(DomainError::Validation(format!(
                "snapshot of {} at version {} is ahead of its stream (version {stream_version})",
                snapshot.aggregate_id, snapshot.version
            )));
        }
        if let Some(stream_type) = stream_type.filter(|t| *t != snapshot.aggregate_type) {
            return Err(DomainError::Validation(format!(
                "snapshot of {} has aggregate type `{}` but stream holds `{stream_type}`",
                snapshot.aggregate_id, snapshot.aggregate_type
            )));
        }

        sqlx::query(
            "INSERT INTO covenant_snapshots (aggregate_id, aggregate_type, version, data, taken_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (aggregate_id) DO UPDATE SET \
                 aggregate_type = EXCLUDED.aggregate_type, \
                 version = EXCLUDED.version, \
                 data = EXCLUDED.data, \
                 taken_at = EXCLUDED.taken_at \
             WHERE covenant_snapshots.version <= EXCLUDED.version",
        )
        .bind(&snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(to_db_version(snapshot.version)?)
        .bind(Json(&snapshot.data))
        .bind(snapshot.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, DomainError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT aggregate_id, aggregate_type, version, data, taken_at \
             FROM covenant_snapshots WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok(Snapshot {
                aggregate_id: row.aggregate_id,
                aggregate_type: row.aggregate_type,
                version: from_db_version(row.version)?,
                data: row.data,
                timestamp: row.taken_at,
            })
        })
        .transpose()
    }

    async fn stream_version(&self, aggregate_id: &str) -> Result<u64, DomainError> {
        let (version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM covenant_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        from_db_version(version)
    }
}
