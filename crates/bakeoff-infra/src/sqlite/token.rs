//! Token log writer: idempotent batch inserts, gap scan, pruning.
//!
//! The batch insert runs in a short transaction with ON CONFLICT DO NOTHING
//! on the composite primary key, so WAL replay overlapping with a late live
//! insert merges silently. Errors are classified for the persistence service:
//! unavailable (fall back to the WAL), retryable (lock contention, retried
//! here with immediate re-attempts), or fatal disk.

use sqlx::Row;

use bakeoff_types::error::DbWriteError;
use bakeoff_types::token::Token;
use bakeoff_types::wal::format_ts;

use super::pool::DatabasePool;

/// Immediate re-attempts for retryable (lock-contention) errors.
const MAX_RETRYABLE_ATTEMPTS: u32 = 3;

/// One finding of the boot-time gap scan: a `(prev, curr)` index pair that is
/// not consecutive within an attempt.
#[derive(Debug, Clone)]
pub struct GapFinding {
    pub request_id: String,
    pub attempt_seq: u32,
    pub token_index: u32,
    pub prev_index: u32,
}

/// SQLite-backed token log.
pub struct SqliteTokenStore {
    pool: DatabasePool,
}

impl SqliteTokenStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Bulk-insert a batch with insert-ignore-on-conflict semantics.
    ///
    /// Retryable errors are re-attempted immediately up to three times; the
    /// classification of the final error is left to the caller.
    pub async fn copy_batch(&self, batch: &[Token]) -> Result<(), DbWriteError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_copy(batch).await {
                Ok(()) => return Ok(()),
                Err(DbWriteError::Retryable(message)) if attempt < MAX_RETRYABLE_ATTEMPTS => {
                    tracing::warn!(attempt, %message, "retryable insert conflict, re-attempting");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_copy(&self, batch: &[Token]) -> Result<(), DbWriteError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(classify_sqlx_error)?;

        for token in batch {
            sqlx::query(
                r#"INSERT INTO token_log
                   (request_id, attempt_seq, token_index, model_id, token_text, ts)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT (request_id, attempt_seq, token_index) DO NOTHING"#,
            )
            .bind(&token.request_id)
            .bind(token.attempt_seq)
            .bind(token.index)
            .bind(&token.model_id)
            .bind(&token.text)
            .bind(format_ts(&token.ts))
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(())
    }

    /// Cheap reachability check used by the replay loop and health endpoint.
    pub async fn ping(&self) -> Result<(), DbWriteError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool.writer)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    /// Boot-time gap scan: report `(prev, curr)` pairs within each
    /// `(request_id, attempt_seq)` where `curr != prev + 1`.
    pub async fn scan_gaps(&self, limit: u32) -> Result<Vec<GapFinding>, DbWriteError> {
        let rows = sqlx::query(
            r#"SELECT request_id, attempt_seq, token_index, prev_index
               FROM (
                   SELECT request_id, attempt_seq, token_index,
                          lag(token_index) OVER (
                              PARTITION BY request_id, attempt_seq
                              ORDER BY token_index
                          ) AS prev_index
                   FROM token_log
               )
               WHERE prev_index IS NOT NULL AND token_index <> prev_index + 1
               LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(classify_sqlx_error)?;

        let mut findings = Vec::with_capacity(rows.len());
        for row in &rows {
            findings.push(GapFinding {
                request_id: row.try_get("request_id").map_err(classify_sqlx_error)?,
                attempt_seq: row.try_get::<i64, _>("attempt_seq").map_err(classify_sqlx_error)?
                    as u32,
                token_index: row.try_get::<i64, _>("token_index").map_err(classify_sqlx_error)?
                    as u32,
                prev_index: row.try_get::<i64, _>("prev_index").map_err(classify_sqlx_error)?
                    as u32,
            });
        }
        Ok(findings)
    }

    /// Delete tokens older than `days`. Returns the number of rows removed.
    /// Called by the external pruner through the admin surface.
    pub async fn prune_older_than(&self, days: u32) -> Result<u64, DbWriteError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
        let result = sqlx::query("DELETE FROM token_log WHERE ts < ?")
            .bind(format_ts(&cutoff))
            .execute(&self.pool.writer)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

/// Map a sqlx error onto the persistence classification.
fn classify_sqlx_error(e: sqlx::Error) -> DbWriteError {
    match &e {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let message = db.message().to_string();
            // SQLITE_BUSY (5), SQLITE_LOCKED (6) and their extended codes are
            // transient lock contention.
            if code == "5" || code == "6" || code == "261" || code == "262" || code == "517" {
                DbWriteError::Retryable(message)
            } else if code == "13" || message.contains("disk is full") {
                // SQLITE_FULL
                DbWriteError::FatalDisk(message)
            } else {
                DbWriteError::Unavailable(message)
            }
        }
        sqlx::Error::Io(io) if io.raw_os_error() == Some(28) => {
            DbWriteError::FatalDisk(io.to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            DbWriteError::Unavailable(e.to_string())
        }
        _ => DbWriteError::Unavailable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn store() -> (tempfile::TempDir, SqliteTokenStore, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteTokenStore::new(pool.clone()), pool)
    }

    fn token(request_id: &str, attempt_seq: u32, index: u32) -> Token {
        Token {
            request_id: request_id.to_string(),
            attempt_seq,
            index,
            model_id: "gpt-4".to_string(),
            text: format!("t{index}"),
            ts: Utc::now(),
        }
    }

    async fn count(pool: &DatabasePool) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM token_log")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        row.0
    }

    #[tokio::test]
    async fn copy_batch_inserts_rows() {
        let (_dir, store, pool) = store().await;
        let batch: Vec<Token> = (0..5).map(|i| token("r1", 1, i)).collect();
        store.copy_batch(&batch).await.unwrap();
        assert_eq!(count(&pool).await, 5);
    }

    #[tokio::test]
    async fn duplicate_inserts_are_idempotent() {
        let (_dir, store, pool) = store().await;
        let batch: Vec<Token> = (0..5).map(|i| token("r1", 1, i)).collect();
        store.copy_batch(&batch).await.unwrap();
        store.copy_batch(&batch).await.unwrap();
        store.copy_batch(&batch[2..]).await.unwrap();
        assert_eq!(count(&pool).await, 5);
    }

    #[tokio::test]
    async fn closed_pool_is_unavailable() {
        let (_dir, store, pool) = store().await;
        pool.close().await;
        let err = store.copy_batch(&[token("r1", 1, 0)]).await.unwrap_err();
        assert!(matches!(err, DbWriteError::Unavailable(_)), "got {err:?}");
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn gap_scan_finds_missing_index() {
        let (_dir, store, _pool) = store().await;
        // Indices {0, 1, 3}: one hole between 1 and 3.
        for i in [0u32, 1, 3] {
            store.copy_batch(&[token("r2", 1, i)]).await.unwrap();
        }
        // A clean attempt for contrast.
        let clean: Vec<Token> = (0..4).map(|i| token("r3", 1, i)).collect();
        store.copy_batch(&clean).await.unwrap();

        let findings = store.scan_gaps(10).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].request_id, "r2");
        assert_eq!(findings[0].prev_index, 1);
        assert_eq!(findings[0].token_index, 3);
    }

    #[tokio::test]
    async fn gap_scan_clean_log_is_empty() {
        let (_dir, store, _pool) = store().await;
        let batch: Vec<Token> = (0..10).map(|i| token("r1", 1, i)).collect();
        store.copy_batch(&batch).await.unwrap();
        assert!(store.scan_gaps(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_removes_only_old_tokens() {
        let (_dir, store, pool) = store().await;
        let mut old = token("r1", 1, 0);
        old.ts = Utc::now() - chrono::Duration::days(200);
        let fresh = token("r1", 1, 1);
        store.copy_batch(&[old, fresh]).await.unwrap();

        let removed = store.prune_older_than(180).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(count(&pool).await, 1);
    }
}
