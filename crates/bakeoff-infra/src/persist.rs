//! Persistence service: database first, WAL fallback.
//!
//! Implements the buffer's `PersistenceBackend` seam. A batch goes to the
//! database; when the database is unavailable (or retryable errors exhaust),
//! the batch is appended to the WAL and reported as deferred -- success for
//! the streaming path, completed later by the replay loop. Only when both
//! media fail does the attempt see a fatal persistence error.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use bakeoff_core::persistence::PersistenceBackend;
use bakeoff_types::error::{DbWriteError, PersistError, PersistOutcome, WalError};
use bakeoff_types::token::Token;

use crate::sqlite::token::SqliteTokenStore;
use crate::wal::WalLog;

pub struct PersistenceService {
    tokens: SqliteTokenStore,
    wal: WalLog,
    last_db_write: Mutex<Option<DateTime<Utc>>>,
    /// Most recent persist duration in ms, +1 (0 means "none yet").
    last_flush_ms: AtomicU64,
}

impl PersistenceService {
    pub fn new(tokens: SqliteTokenStore, wal: WalLog) -> Self {
        Self {
            tokens,
            wal,
            last_db_write: Mutex::new(None),
            last_flush_ms: AtomicU64::new(0),
        }
    }

    /// Cheap database health check used by the replay loop.
    pub async fn db_is_up(&self) -> bool {
        self.tokens.ping().await.is_ok()
    }

    /// Wall time of the last successful database write (live or replay).
    pub fn last_db_write(&self) -> Option<DateTime<Utc>> {
        *self.last_db_write.lock().expect("last_db_write poisoned")
    }

    /// Duration of the most recent persist call in ms.
    pub fn last_flush_ms(&self) -> Option<u64> {
        match self.last_flush_ms.load(Ordering::Relaxed) {
            0 => None,
            stored => Some(stored - 1),
        }
    }

    /// Record a successful direct database write (used by the replay loop,
    /// which writes through [`Self::token_store`] itself).
    pub fn record_db_write(&self) {
        *self.last_db_write.lock().expect("last_db_write poisoned") = Some(Utc::now());
    }

    pub fn token_store(&self) -> &SqliteTokenStore {
        &self.tokens
    }

    pub fn wal(&self) -> &WalLog {
        &self.wal
    }
}

impl PersistenceBackend for PersistenceService {
    async fn persist(&self, batch: Vec<Token>) -> Result<PersistOutcome, PersistError> {
        let started = Instant::now();
        let count = batch.len();

        let db_error = match self.tokens.copy_batch(&batch).await {
            Ok(()) => {
                self.record_db_write();
                self.note_flush(started);
                tracing::debug!(count, "batch persisted to database");
                return Ok(PersistOutcome::Persisted);
            }
            Err(DbWriteError::FatalDisk(message)) => {
                return Err(PersistError::DiskFull(message));
            }
            Err(e) => e,
        };

        // DbUnavailable, or retryable errors exhausted: defer to the WAL.
        tracing::warn!(count, error = %db_error, "database write failed, deferring to wal");
        match self.wal.append(&batch).await {
            Ok(()) => {
                self.note_flush(started);
                Ok(PersistOutcome::Deferred)
            }
            Err(WalError::DiskFull(message)) => Err(PersistError::DiskFull(format!(
                "db unavailable and wal disk full: {message}"
            ))),
            Err(wal_error) => Err(PersistError::Failed(format!(
                "db: {db_error}; wal: {wal_error}"
            ))),
        }
    }
}

impl PersistenceService {
    fn note_flush(&self, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.last_flush_ms.store(elapsed_ms + 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::sqlite::DatabasePool;

    async fn service(dir: &tempfile::TempDir) -> (PersistenceService, DatabasePool) {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let wal = WalLog::new(dir.path().join("tokens.wal"), 1024 * 1024)
            .await
            .unwrap();
        (
            PersistenceService::new(SqliteTokenStore::new(pool.clone()), wal),
            pool,
        )
    }

    fn batch(n: u32) -> Vec<Token> {
        (0..n)
            .map(|i| Token {
                request_id: "r1".to_string(),
                attempt_seq: 1,
                index: i,
                model_id: "gpt-4".to_string(),
                text: format!("t{i}"),
                ts: Utc::now(),
            })
            .collect()
    }

    #[tokio::test]
    async fn persists_to_database_when_up() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pool) = service(&dir).await;

        let outcome = service.persist(batch(4)).await.unwrap();
        assert_eq!(outcome, PersistOutcome::Persisted);
        assert!(service.last_db_write().is_some());
        assert!(service.last_flush_ms().is_some());
        assert_eq!(service.wal().size_bytes().await, 0);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM token_log")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert_eq!(count.0, 4);
    }

    #[tokio::test]
    async fn defers_to_wal_when_database_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pool) = service(&dir).await;
        pool.close().await;

        assert!(!service.db_is_up().await);
        let outcome = service.persist(batch(3)).await.unwrap();
        assert_eq!(outcome, PersistOutcome::Deferred);

        // Every token of the batch is on disk.
        let mut lines = service.wal().read_lines().await.unwrap().unwrap();
        let mut count = 0;
        while lines.next_line().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(service.last_db_write().is_none());
    }
}
