//! Pluggable entity-state persistence.
//!
//! State is an opaque serialized blob keyed by `(entity_kind, entity_key)`
//! with a monotonically increasing version used for optimistic concurrency.

use crate::runtime::EntityKind;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{PgPool, Row};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store failure: {0}")]
    Backend(String),
    #[error("version conflict for {kind}/{key}: expected {expected}")]
    VersionConflict { kind: &'static str, key: String, expected: u64 },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StoredState {
    pub version: u64,
    pub blob: Vec<u8>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, kind: EntityKind, key: &str) -> Result<Option<StoredState>, StoreError>;

    /// Compare-and-set write. `expected_version` of 0 means "must not exist".
    /// Returns the new version.
    async fn save(
        &self,
        kind: EntityKind,
        key: &str,
        expected_version: u64,
        blob: Vec<u8>,
    ) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryStateStore {
    states: DashMap<(EntityKind, String), StoredState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, kind: EntityKind, key: &str) -> Result<Option<StoredState>, StoreError> {
        Ok(self.states.get(&(kind, key.to_string())).map(|s| s.value().clone()))
    }

    async fn save(
        &self,
        kind: EntityKind,
        key: &str,
        expected_version: u64,
        blob: Vec<u8>,
    ) -> Result<u64, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.states.entry((kind, key.to_string())) {
            Entry::Vacant(slot) => {
                if expected_version != 0 {
                    return Err(StoreError::VersionConflict {
                        kind: kind.as_str(),
                        key: key.to_string(),
                        expected: expected_version,
                    });
                }
                slot.insert(StoredState { version: 1, blob });
                Ok(1)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get().version;
                if current != expected_version {
                    return Err(StoreError::VersionConflict {
                        kind: kind.as_str(),
                        key: key.to_string(),
                        expected: expected_version,
                    });
                }
                let next = current + 1;
                slot.insert(StoredState { version: next, blob });
                Ok(next)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL backend
// ---------------------------------------------------------------------------

/// Rows live in `entity_states (entity_kind, entity_key, version, blob)` with
/// a primary key on `(entity_kind, entity_key)`.
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn load(&self, kind: EntityKind, key: &str) -> Result<Option<StoredState>, StoreError> {
        let row = sqlx::query(
            "SELECT version, blob FROM entity_states
             WHERE entity_kind = $1 AND entity_key = $2",
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredState {
            version: r.get::<i64, _>("version") as u64,
            blob: r.get::<Vec<u8>, _>("blob"),
        }))
    }

    async fn save(
        &self,
        kind: EntityKind,
        key: &str,
        expected_version: u64,
        blob: Vec<u8>,
    ) -> Result<u64, StoreError> {
        let rows_affected = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO entity_states (entity_kind, entity_key, version, blob)
                 VALUES ($1, $2, 1, $3)
                 ON CONFLICT (entity_kind, entity_key) DO NOTHING",
            )
            .bind(kind.as_str())
            .bind(key)
            .bind(&blob)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE entity_states
                 SET version = version + 1, blob = $3
                 WHERE entity_kind = $1 AND entity_key = $2 AND version = $4",
            )
            .bind(kind.as_str())
            .bind(key)
            .bind(&blob)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if rows_affected == 0 {
            return Err(StoreError::VersionConflict {
                kind: kind.as_str(),
                key: key.to_string(),
                expected: expected_version,
            });
        }
        Ok(expected_version + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = InMemoryStateStore::new();
        let v = store.save(EntityKind::Wallet, "u1", 0, b"state-1".to_vec()).await.unwrap();
        assert_eq!(v, 1);
        let loaded = store.load(EntityKind::Wallet, "u1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.blob, b"state-1");
    }

    #[tokio::test]
    async fn stale_writes_are_rejected() {
        let store = InMemoryStateStore::new();
        store.save(EntityKind::Wallet, "u1", 0, b"v1".to_vec()).await.unwrap();
        store.save(EntityKind::Wallet, "u1", 1, b"v2".to_vec()).await.unwrap();

        let stale = store.save(EntityKind::Wallet, "u1", 1, b"v2-dup".to_vec()).await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { .. })));

        let loaded = store.load(EntityKind::Wallet, "u1").await.unwrap().unwrap();
        assert_eq!(loaded.blob, b"v2");
    }

    #[tokio::test]
    async fn kinds_do_not_collide_on_the_same_key() {
        let store = InMemoryStateStore::new();
        store.save(EntityKind::Wallet, "k", 0, b"wallet".to_vec()).await.unwrap();
        store.save(EntityKind::Bet, "k", 0, b"bet".to_vec()).await.unwrap();
        assert_eq!(store.load(EntityKind::Wallet, "k").await.unwrap().unwrap().blob, b"wallet");
        assert_eq!(store.load(EntityKind::Bet, "k").await.unwrap().unwrap().blob, b"bet");
    }
}
