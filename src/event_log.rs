//! Append-only per-aggregate event streams.
//!
//! Versions are strictly increasing without gaps; `(aggregate_id, version)`
//! is unique in every backend.

use crate::events::DomainEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event store failure: {0}")]
    Backend(String),
    #[error("corrupt event payload for {aggregate_id} v{version}: {message}")]
    Corrupt { aggregate_id: String, version: u64, message: String },
}

impl From<sqlx::Error> for EventLogError {
    fn from(e: sqlx::Error) -> Self {
        EventLogError::Backend(e.to_string())
    }
}

/// An event together with its position in the aggregate's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub version: u64,
    pub event: DomainEvent,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Atomic append; returns the version assigned to the event.
    async fn append(&self, aggregate_id: &str, event: DomainEvent) -> Result<u64, EventLogError>;

    /// Append a batch in one transaction; returns the last assigned version.
    async fn append_many(
        &self,
        aggregate_id: &str,
        events: Vec<DomainEvent>,
    ) -> Result<u64, EventLogError>;

    /// Read the stream from `from_version` (exclusive of nothing; 0 = full).
    async fn read(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, EventLogError>;

    async fn exists(&self, aggregate_id: &str) -> Result<bool, EventLogError>;
}

// ---------------------------------------------------------------------------
// In-memory backend (tests and single-node development)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StreamInner {
    events: Vec<RecordedEvent>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryEventLog {
    streams: DashMap<String, Arc<Mutex<StreamInner>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, aggregate_id: &str) -> Arc<Mutex<StreamInner>> {
        self.streams
            .entry(aggregate_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamInner::default())))
            .clone()
    }

    fn push_locked(inner: &mut StreamInner, event: DomainEvent) -> u64 {
        let version = inner.events.len() as u64 + 1;
        let now = Utc::now();
        inner.created_at.get_or_insert(now);
        inner.updated_at = Some(now);
        inner.events.push(RecordedEvent { version, event });
        version
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, aggregate_id: &str, event: DomainEvent) -> Result<u64, EventLogError> {
        let stream = self.stream(aggregate_id);
        let mut inner = stream.lock().expect("event stream lock poisoned");
        Ok(Self::push_locked(&mut inner, event))
    }

    async fn append_many(
        &self,
        aggregate_id: &str,
        events: Vec<DomainEvent>,
    ) -> Result<u64, EventLogError> {
        let stream = self.stream(aggregate_id);
        let mut inner = stream.lock().expect("event stream lock poisoned");
        let mut last = inner.events.len() as u64;
        for event in events {
            last = Self::push_locked(&mut inner, event);
        }
        Ok(last)
    }

    async fn read(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        match self.streams.get(aggregate_id) {
            None => Ok(Vec::new()),
            Some(stream) => {
                let inner = stream.lock().expect("event stream lock poisoned");
                Ok(inner
                    .events
                    .iter()
                    .filter(|r| r.version > from_version)
                    .cloned()
                    .collect())
            }
        }
    }

    async fn exists(&self, aggregate_id: &str) -> Result<bool, EventLogError> {
        Ok(self
            .streams
            .get(aggregate_id)
            .map(|s| !s.lock().expect("event stream lock poisoned").events.is_empty())
            .unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL backend
// ---------------------------------------------------------------------------

/// Rows live in `event_streams (aggregate_id, version, event_type, timestamp,
/// payload)` with a unique key on `(aggregate_id, version)`.
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_next(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        aggregate_id: &str,
        event: &DomainEvent,
    ) -> Result<u64, EventLogError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| EventLogError::Backend(format!("serialize event: {e}")))?;
        let row = sqlx::query(
            "INSERT INTO event_streams (aggregate_id, version, event_type, timestamp, payload)
             SELECT $1, COALESCE(MAX(version), 0) + 1, $2, $3, $4
             FROM event_streams WHERE aggregate_id = $1
             RETURNING version",
        )
        .bind(aggregate_id)
        .bind(event.payload.kind())
        .bind(event.timestamp)
        .bind(payload)
        .fetch_one(tx.as_mut())
        .await?;
        let version: i64 = row.get("version");
        Ok(version as u64)
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    async fn append(&self, aggregate_id: &str, event: DomainEvent) -> Result<u64, EventLogError> {
        let mut tx = self.pool.begin().await?;
        let version = Self::insert_next(&mut tx, aggregate_id, &event).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn append_many(
        &self,
        aggregate_id: &str,
        events: Vec<DomainEvent>,
    ) -> Result<u64, EventLogError> {
        let mut tx = self.pool.begin().await?;
        let mut last = 0;
        for event in &events {
            last = Self::insert_next(&mut tx, aggregate_id, event).await?;
        }
        tx.commit().await?;
        Ok(last)
    }

    async fn read(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let rows = sqlx::query(
            "SELECT version, payload FROM event_streams
             WHERE aggregate_id = $1 AND version > $2
             ORDER BY version ASC",
        )
        .bind(aggregate_id)
        .bind(from_version as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let version: i64 = row.get("version");
            let payload: String = row.get("payload");
            let event: DomainEvent =
                serde_json::from_str(&payload).map_err(|e| EventLogError::Corrupt {
                    aggregate_id: aggregate_id.to_string(),
                    version: version as u64,
                    message: e.to_string(),
                })?;
            out.push(RecordedEvent { version: version as u64, event });
        }
        Ok(out)
    }

    async fn exists(&self, aggregate_id: &str) -> Result<bool, EventLogError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM event_streams WHERE aggregate_id = $1")
                .bind(aggregate_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use crate::money::{Money, DEFAULT_CURRENCY};
    use uuid::Uuid;

    fn deposit_event(aggregate: &str) -> DomainEvent {
        DomainEvent::new(
            aggregate,
            EventPayload::FundsDeposited {
                user_id: "u1".into(),
                amount: Money::major(10, DEFAULT_CURRENCY),
                transaction_id: Uuid::new_v4(),
            },
        )
    }

    #[tokio::test]
    async fn versions_are_strictly_increasing_without_gaps() {
        let log = InMemoryEventLog::new();
        for expected in 1..=5u64 {
            let v = log.append("wallet:u1", deposit_event("wallet:u1")).await.unwrap();
            assert_eq!(v, expected);
        }
        let stream = log.read("wallet:u1", 0).await.unwrap();
        let versions: Vec<u64> = stream.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn append_many_assigns_contiguous_versions() {
        let log = InMemoryEventLog::new();
        log.append("wallet:u2", deposit_event("wallet:u2")).await.unwrap();
        let last = log
            .append_many(
                "wallet:u2",
                vec![deposit_event("wallet:u2"), deposit_event("wallet:u2")],
            )
            .await
            .unwrap();
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn read_from_version_skips_earlier_events() {
        let log = InMemoryEventLog::new();
        for _ in 0..4 {
            log.append("wallet:u3", deposit_event("wallet:u3")).await.unwrap();
        }
        let tail = log.read("wallet:u3", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, 3);
    }

    #[tokio::test]
    async fn exists_reflects_appends() {
        let log = InMemoryEventLog::new();
        assert!(!log.exists("wallet:u4").await.unwrap());
        log.append("wallet:u4", deposit_event("wallet:u4")).await.unwrap();
        assert!(log.exists("wallet:u4").await.unwrap());
    }

    #[tokio::test]
    async fn streams_are_isolated_per_aggregate() {
        let log = InMemoryEventLog::new();
        log.append("wallet:a", deposit_event("wallet:a")).await.unwrap();
        log.append("wallet:b", deposit_event("wallet:b")).await.unwrap();
        assert_eq!(log.read("wallet:a", 0).await.unwrap().len(), 1);
        assert_eq!(log.read("wallet:b", 0).await.unwrap().len(), 1);
    }
}
