//! SQLite-backed shared store
//!
//! Several orchestrator processes on one host can point at the same file.
//! Each bucket swap is a single conditional statement, so a concurrent
//! writer makes the swap affect zero rows rather than double-spend a token.

use super::{BucketState, SharedStore};
use crate::error::StoreError;
use async_trait::async_trait;
use medley_common::{Clock, SystemClock};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Connection pool size per process
const POOL_SIZE: u32 = 4;

/// How long a writer waits on SQLite's lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) the store file and its tables
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        debug!("Opening shared store: {}", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(Duration::from_secs(2))
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .busy_timeout(BUSY_TIMEOUT)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .create_if_missing(true),
            )
            .await?;

        init_tables(&pool).await?;
        info!("Shared store ready: {}", path.display());

        Ok(Self { pool, clock })
    }
}

async fn init_tables(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            created_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_buckets (
            key TEXT PRIMARY KEY,
            tokens REAL NOT NULL,
            last_refill_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT value FROM cache_entries WHERE key = ? AND expires_at_ms > ?",
        )
        .bind(key)
        .bind(self.clock.now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, created_at_ms, expires_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                created_at_ms = excluded.created_at_ms,
                expires_at_ms = excluded.expires_at_ms
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now + ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        let row: Option<(f64, i64)> =
            sqlx::query_as("SELECT tokens, last_refill_ms FROM rate_buckets WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(tokens, last_refill_ms)| BucketState {
            tokens,
            last_refill_ms,
        }))
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
    ) -> Result<bool, StoreError> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO rate_buckets (key, tokens, last_refill_ms)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(new.tokens)
                .bind(new.last_refill_ms)
                .execute(&self.pool)
                .await?
            }
            Some(old) => {
                sqlx::query(
                    r#"
                    UPDATE rate_buckets
                    SET tokens = ?, last_refill_ms = ?
                    WHERE key = ? AND tokens = ? AND last_refill_ms = ?
                    "#,
                )
                .bind(new.tokens)
                .bind(new.last_refill_ms)
                .bind(key)
                .bind(old.tokens)
                .bind(old.last_refill_ms)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at_ms <= ?")
            .bind(self.clock.now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
