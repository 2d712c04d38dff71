//! SQLite attempt store.
//!
//! Implements `AttemptStore` from `bakeoff-core`. Timestamps are stored as
//! millisecond-precision UTC text, matching the token log.

use chrono::Utc;

use bakeoff_core::repository::AttemptStore;
use bakeoff_types::error::RepositoryError;
use bakeoff_types::token::{Attempt, AttemptStatus};
use bakeoff_types::wal::format_ts;

use super::pool::DatabasePool;

pub struct SqliteAttemptStore {
    pool: DatabasePool,
}

impl SqliteAttemptStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Persisted attempt count for the status surface.
    pub async fn count_total(&self) -> Result<i64, RepositoryError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM attempts")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(row.0)
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl AttemptStore for SqliteAttemptStore {
    async fn create(&self, attempt: &Attempt) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO attempts
               (request_id, attempt_seq, model_id, provider, status, started_at, ended_at, error_kind)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&attempt.request_id)
        .bind(attempt.attempt_seq)
        .bind(&attempt.model_id)
        .bind(&attempt.provider)
        .bind(attempt.status.to_string())
        .bind(format_ts(&attempt.started_at))
        .bind(attempt.ended_at.as_ref().map(format_ts))
        .bind(&attempt.error_kind)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn finish(
        &self,
        request_id: &str,
        attempt_seq: u32,
        status: AttemptStatus,
        error_kind: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE attempts SET status = ?, ended_at = ?, error_kind = ?
               WHERE request_id = ? AND attempt_seq = ?"#,
        )
        .bind(status.to_string())
        .bind(format_ts(&Utc::now()))
        .bind(error_kind)
        .bind(request_id)
        .bind(attempt_seq)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    async fn store() -> (tempfile::TempDir, SqliteAttemptStore, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteAttemptStore::new(pool.clone()), pool)
    }

    fn attempt(request_id: &str, attempt_seq: u32) -> Attempt {
        Attempt {
            request_id: request_id.to_string(),
            attempt_seq,
            model_id: "gpt-4".to_string(),
            provider: "openai".to_string(),
            status: AttemptStatus::Streaming,
            started_at: Utc::now(),
            ended_at: None,
            error_kind: None,
        }
    }

    #[tokio::test]
    async fn create_then_finish_updates_row() {
        let (_dir, store, pool) = store().await;
        store.create(&attempt("r1", 1)).await.unwrap();
        store
            .finish("r1", 1, AttemptStatus::Failed, Some("provider_down"))
            .await
            .unwrap();

        let row: (String, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT status, error_kind, ended_at FROM attempts WHERE request_id = ? AND attempt_seq = ?",
        )
        .bind("r1")
        .bind(1)
        .fetch_one(&pool.reader)
        .await
        .unwrap();

        assert_eq!(row.0, "failed");
        assert_eq!(row.1.as_deref(), Some("provider_down"));
        let ended = row.2.expect("ended_at must be set");
        DateTime::parse_from_rfc3339(&ended).unwrap();
    }

    #[tokio::test]
    async fn finish_unknown_attempt_is_not_found() {
        let (_dir, store, _pool) = store().await;
        let err = store
            .finish("nope", 1, AttemptStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn count_total_is_persisted() {
        let (_dir, store, _pool) = store().await;
        assert_eq!(store.count_total().await.unwrap(), 0);
        store.create(&attempt("r1", 1)).await.unwrap();
        store.create(&attempt("r1", 2)).await.unwrap();
        store.create(&attempt("r2", 1)).await.unwrap();
        assert_eq!(store.count_total().await.unwrap(), 3);
    }
}
