use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

use crate::error::StoreError;
use crate::model::{Cursor, PipelinePosition};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)?.create_if_missing(true);
    if !in_memory {
        // WAL and stricter durability for the on-disk store.
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    // Each in-memory connection is its own database, so keep exactly one.
    let max_connections = if in_memory { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// True once the schema exists, i.e. `migrate` or `prepare` has been run.
#[instrument(skip_all)]
pub async fn schema_exists(pool: &Pool) -> Result<bool, StoreError> {
    let found: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'pipeline_position'",
    )
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

#[instrument(skip_all)]
pub async fn fetch_position(pool: &Pool) -> Result<Option<PipelinePosition>, StoreError> {
    let row = sqlx::query("SELECT last_cursor, updated_at FROM pipeline_position WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(PipelinePosition {
        last_cursor: Cursor(row.try_get::<i64, _>("last_cursor")?),
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    }))
}

/// The recorded position, or `NotInitialized` when there is none yet.
pub async fn require_position(pool: &Pool) -> Result<PipelinePosition, StoreError> {
    if !schema_exists(pool).await? {
        return Err(StoreError::NotInitialized);
    }
    fetch_position(pool).await?.ok_or(StoreError::NotInitialized)
}

/// Apply pending migrations to a prepared store. An unprepared store is left
/// untouched so that a later `prepare` still seeds it from the feed end.
#[instrument(skip_all)]
pub async fn migrate_prepared(pool: &Pool) -> Result<PipelinePosition, StoreError> {
    let position = require_position(pool).await?;
    run_migrations(pool).await?;
    Ok(position)
}

/// Seed the position row. Fails if a position has already been recorded.
#[instrument(skip_all, fields(cursor = %cursor))]
pub async fn insert_position(pool: &Pool, cursor: Cursor) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT last_cursor FROM pipeline_position WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await?;
    if let Some(existing) = existing {
        return Err(StoreError::AlreadyInitialized(Cursor(existing)));
    }
    sqlx::query("INSERT INTO pipeline_position (id, last_cursor, updated_at) VALUES (1, ?, ?)")
        .bind(cursor.value())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Move the cursor forward in one statement. Returns false, leaving the row
/// untouched, when the stored cursor is already at or past `cursor`.
#[instrument(skip_all, fields(cursor = %cursor))]
pub async fn advance_position(pool: &Pool, cursor: Cursor) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "INSERT INTO pipeline_position (id, last_cursor, updated_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET last_cursor = excluded.last_cursor, updated_at = excluded.updated_at \
         WHERE pipeline_position.last_cursor < excluded.last_cursor",
    )
    .bind(cursor.value())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn seed_then_advance() {
        let pool = setup_pool().await;
        assert!(schema_exists(&pool).await.unwrap());
        assert!(fetch_position(&pool).await.unwrap().is_none());

        insert_position(&pool, Cursor(100)).await.unwrap();
        let err = insert_position(&pool, Cursor(5)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyInitialized(Cursor(100))));

        assert!(advance_position(&pool, Cursor(103)).await.unwrap());
        assert!(!advance_position(&pool, Cursor(103)).await.unwrap());
        assert!(!advance_position(&pool, Cursor(101)).await.unwrap());
        let pos = fetch_position(&pool).await.unwrap().unwrap();
        assert_eq!(pos.last_cursor, Cursor(103));
    }

    #[tokio::test]
    async fn advance_without_seed_creates_row() {
        let pool = setup_pool().await;
        assert!(advance_position(&pool, Cursor(7)).await.unwrap());
        let pos = fetch_position(&pool).await.unwrap().unwrap();
        assert_eq!(pos.last_cursor, Cursor(7));
    }

    #[tokio::test]
    async fn migrate_refuses_an_unprepared_store() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        let err = migrate_prepared(&pool).await.unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized));
        assert!(!schema_exists(&pool).await.unwrap());

        // Schema without a position row is still unprepared.
        run_migrations(&pool).await.unwrap();
        assert!(matches!(
            migrate_prepared(&pool).await,
            Err(StoreError::NotInitialized)
        ));
        assert!(matches!(
            require_position(&pool).await,
            Err(StoreError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn migrate_keeps_the_recorded_position() {
        let pool = setup_pool().await;
        insert_position(&pool, Cursor(250)).await.unwrap();
        let position = migrate_prepared(&pool).await.unwrap();
        assert_eq!(position.last_cursor, Cursor(250));
        assert_eq!(require_position(&pool).await.unwrap().last_cursor, Cursor(250));
    }

    #[test]
    fn prepare_sqlite_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn prepare_sqlite_url_creates_parent_dir() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("feed.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert!(rebuilt.starts_with("sqlite://"));
        assert!(rebuilt.ends_with("?mode=rwc"));
        assert!(td.path().join("nested").exists());
    }
}
