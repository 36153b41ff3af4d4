use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::repo::{self, Pool};
use crate::error::StoreError;
use crate::model::Cursor;

/// Durable record of the last processed feed cursor.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Current cursor, or the seed if no position has been recorded yet.
    async fn load(&self) -> Result<Cursor, StoreError>;

    /// Record `cursor`. Fails with `StaleWrite` if the stored cursor is
    /// already at or past it.
    async fn save(&self, cursor: Cursor) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqlitePositionStore {
    pool: Pool,
    seed: Cursor,
}

impl SqlitePositionStore {
    pub fn new(pool: Pool, seed: Cursor) -> Self {
        Self { pool, seed }
    }
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    #[instrument(skip_all)]
    async fn load(&self) -> Result<Cursor, StoreError> {
        let position = repo::fetch_position(&self.pool).await?;
        Ok(position.map_or(self.seed, |p| p.last_cursor))
    }

    #[instrument(skip_all, fields(cursor = %cursor))]
    async fn save(&self, cursor: Cursor) -> Result<(), StoreError> {
        if repo::advance_position(&self.pool, cursor).await? {
            debug!("persisted feed position");
            return Ok(());
        }
        let stored = repo::fetch_position(&self.pool)
            .await?
            .map_or(self.seed, |p| p.last_cursor);
        Err(StoreError::StaleWrite {
            stored,
            attempted: cursor,
        })
    }
}

/// Non-durable store for diagnostic runs that must not move the real cursor.
#[derive(Debug)]
pub struct MemoryPositionStore {
    cursor: Mutex<Cursor>,
}

impl MemoryPositionStore {
    pub fn new(seed: Cursor) -> Self {
        Self {
            cursor: Mutex::new(seed),
        }
    }

    pub async fn current(&self) -> Cursor {
        *self.cursor.lock().await
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<Cursor, StoreError> {
        Ok(*self.cursor.lock().await)
    }

    async fn save(&self, cursor: Cursor) -> Result<(), StoreError> {
        let mut guard = self.cursor.lock().await;
        if *guard >= cursor {
            return Err(StoreError::StaleWrite {
                stored: *guard,
                attempted: cursor,
            });
        }
        *guard = cursor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store(seed: i64) -> SqlitePositionStore {
        let pool = repo::init_pool("sqlite::memory:").await.unwrap();
        repo::run_migrations(&pool).await.unwrap();
        SqlitePositionStore::new(pool, Cursor(seed))
    }

    #[tokio::test]
    async fn load_returns_seed_until_first_save() {
        let store = setup_store(42).await;
        assert_eq!(store.load().await.unwrap(), Cursor(42));
        store.save(Cursor(50)).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Cursor(50));
    }

    #[tokio::test]
    async fn save_rejects_non_advancing_cursor() {
        let store = setup_store(0).await;
        store.save(Cursor(103)).await.unwrap();
        let err = store.save(Cursor(102)).await.unwrap_err();
        match err {
            StoreError::StaleWrite { stored, attempted } => {
                assert_eq!(stored, Cursor(103));
                assert_eq!(attempted, Cursor(102));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            store.save(Cursor(103)).await,
            Err(StoreError::StaleWrite { .. })
        ));
        assert_eq!(store.load().await.unwrap(), Cursor(103));
    }

    #[tokio::test]
    async fn prepared_position_wins_over_seed() {
        let store = setup_store(0).await;
        repo::insert_position(&store.pool, Cursor(900)).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Cursor(900));
    }

    #[tokio::test]
    async fn memory_store_enforces_monotonic_saves() {
        let store = MemoryPositionStore::new(Cursor(10));
        store.save(Cursor(11)).await.unwrap();
        assert!(store.save(Cursor(11)).await.is_err());
        assert_eq!(store.current().await, Cursor(11));
    }
}
