// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable checkpoint documents in SQLite.
//!
//! One row per checkpoint key. Writes go straight to disk; debouncing is the
//! [`Checkpointer`](super::Checkpointer)'s job, so this store only sees a
//! write every save interval per direction.
//!
//! The stored `lastSequence` only ever names a sequence whose revisions are
//! all applied locally. A crash between inserting and saving re-fetches a few
//! revisions on restart, which the revision tree absorbs.
//!
//! Another process holding the file can make a statement fail with
//! `SQLITE_BUSY` or `SQLITE_LOCKED`; those are retried a few times with a
//! doubling pause.

use super::CheckpointDoc;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const LOCK_ATTEMPTS: u32 = 5;
const LOCK_FIRST_PAUSE: Duration = Duration::from_millis(10);
const LOCK_MAX_PAUSE: Duration = Duration::from_millis(500);

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6).
fn is_lock_contention(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    match db.code() {
        Some(code) => matches!(code.as_ref(), "5" | "6"),
        None => {
            let message = db.message().to_ascii_lowercase();
            message.contains("database is locked") || message.contains("database is busy")
        }
    }
}

async fn retry_on_lock<T, F, Fut>(statement: &str, mut run: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut pause = LOCK_FIRST_PAUSE;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run().await {
            Err(e) if attempt < LOCK_ATTEMPTS && is_lock_contention(&e) => {
                warn!(statement, attempt, pause_ms = pause.as_millis() as u64, "Checkpoint database locked");
                crate::metrics::checkpoint_retries_total(statement);
                tokio::time::sleep(pause).await;
                pause = (pause * 2).min(LOCK_MAX_PAUSE);
            }
            outcome => {
                if attempt > 1 && outcome.is_ok() {
                    debug!(statement, attempt, "Checkpoint statement went through after lock");
                }
                return outcome;
            }
        }
    }
}

/// Checkpoint documents keyed by checkpoint ID.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().display().to_string();
        info!(%path, "Opening checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}?mode=rwc"))
            .map_err(|e| ReplicationError::Config(format!("bad checkpoint database path {path}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().max_connections(2).connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                last_sequence TEXT NOT NULL,
                local_uuid TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    pub async fn get(&self, checkpoint_id: &str) -> Result<Option<CheckpointDoc>> {
        let pool = &self.pool;
        let row: Option<(String, String)> = retry_on_lock("checkpoint_get", || async {
            sqlx::query_as(
                "SELECT last_sequence, local_uuid FROM checkpoints WHERE checkpoint_id = ?",
            )
            .bind(checkpoint_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        Ok(row.map(|(last_sequence, local_uuid)| CheckpointDoc {
            last_sequence,
            local_uuid,
        }))
    }

    pub async fn put(&self, checkpoint_id: &str, doc: &CheckpointDoc) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        retry_on_lock("checkpoint_put", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (checkpoint_id, last_sequence, local_uuid, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(checkpoint_id) DO UPDATE SET
                    last_sequence = excluded.last_sequence,
                    local_uuid = excluded.local_uuid,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(checkpoint_id)
            .bind(&doc.last_sequence)
            .bind(&doc.local_uuid)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(checkpoint_id, last_sequence = %doc.last_sequence, "Checkpoint persisted");
        Ok(())
    }

    /// Forget a checkpoint (the next replication starts over).
    pub async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        let pool = &self.pool;
        retry_on_lock("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE checkpoint_id = ?")
                .bind(checkpoint_id)
                .execute(pool)
                .await
        })
        .await?;

        info!(checkpoint_id, "Deleted checkpoint");
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        let pool = &self.pool;
        let truncated = retry_on_lock("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await;
        if let Err(e) = truncated {
            warn!(error = %e, "Could not fold the WAL back before closing");
        }
        pool.close().await;
        info!("Checkpoint store closed");
    }
}
