// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite checkpoint backend.
//!
//! For deployments where the destination can't (or shouldn't) hold the
//! checkpoint record, positions are kept in a local SQLite file.
//!
//! # Synchronous Writes
//!
//! Every save is written through immediately. There is no write-behind
//! cache: the stored position must correspond to an applied event at every
//! instant, so a crash can only ever cause redelivery, never a gap.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. We handle this with:
//! - Automatic retry with exponential backoff
//! - Bounded attempts (default 5)

use crate::error::{RelayError, Result};
use crate::feed::Position;
use crate::store::{BoxFuture, CheckpointBackend, StoreHandle};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::sqlite_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// A stored checkpoint row.
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub id: String,
    pub position: Position,
    /// Milliseconds since epoch of the last save
    pub updated_at: i64,
}

/// Checkpoint backend persisting to a SQLite file.
pub struct SqliteCheckpointBackend {
    pool: SqlitePool,
    path: String,
    closed: AtomicBool,
}

impl SqliteCheckpointBackend {
    /// Open (or create) the checkpoint database at `path`.
    ///
    /// Use `":memory:"` for a throwaway database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing SQLite checkpoint store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RelayError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // A single connection keeps an in-memory database alive and shared.
        let mut pool_options = SqlitePoolOptions::new().max_connections(2);
        if in_memory {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                position TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
            closed: AtomicBool::new(false),
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read a full checkpoint row.
    pub async fn row(&self, id: &str) -> Result<Option<CheckpointRow>> {
        let pool = &self.pool;
        let row: Option<(String, String, i64)> = execute_with_retry("checkpoint_row", || async {
            sqlx::query_as("SELECT id, position, updated_at FROM checkpoints WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await
        })
        .await?;

        Ok(row.map(|(id, position, updated_at)| CheckpointRow {
            id,
            position: Position::new(position),
            updated_at,
        }))
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown(format!("sqlite:{}", self.path)));
        }
        Ok(())
    }
}

impl StoreHandle for SqliteCheckpointBackend {
    fn name(&self) -> &str {
        "sqlite-checkpoints"
    }

    /// Checkpoints the WAL and closes the pool. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if let Err(e) = self.wal_checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
            self.pool.close().await;
            info!(path = %self.path, "SQLite checkpoint store closed");
            Ok(())
        })
    }
}

impl CheckpointBackend for SqliteCheckpointBackend {
    fn upsert_checkpoint(&self, id: &str, position: &Position) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        let position = position.as_str().to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;

            execute_with_retry("checkpoint_upsert", || async {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (id, position, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        position = excluded.position,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&id)
                .bind(&position)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            debug!(id = %id, position = %position, "Checkpoint persisted");
            Ok(())
        })
    }

    fn get_checkpoint(&self, id: &str) -> BoxFuture<'_, Option<Position>> {
        let id = id.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.row(&id).await?.map(|row| row.position))
        })
    }
}
