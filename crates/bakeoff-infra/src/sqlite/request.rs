//! SQLite request store.

use bakeoff_core::repository::RequestStore;
use bakeoff_types::error::RepositoryError;
use bakeoff_types::token::{Request, RequestStatus};
use bakeoff_types::wal::format_ts;

use super::pool::DatabasePool;

pub struct SqliteRequestStore {
    pool: DatabasePool,
}

impl SqliteRequestStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl RequestStore for SqliteRequestStore {
    async fn create(&self, request: &Request) -> Result<(), RepositoryError> {
        let models = serde_json::to_string(&request.models)
            .map_err(|e| RepositoryError::Query(format!("serialize models: {e}")))?;
        sqlx::query(
            r#"INSERT INTO requests (request_id, prompt, models, status, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&request.request_id)
        .bind(&request.prompt)
        .bind(&models)
        .bind(request.status.to_string())
        .bind(format_ts(&request.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn set_status(
        &self,
        request_id: &str,
        status: RequestStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE requests SET status = ? WHERE request_id = ?")
            .bind(status.to_string())
            .bind(request_id)
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
    use bakeoff_types::token::ModelChoice;
    use chrono::Utc;

    #[tokio::test]
    async fn create_and_transition_request() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let store = SqliteRequestStore::new(pool.clone());

        let request = Request {
            request_id: "r1".to_string(),
            prompt: "compare".to_string(),
            models: vec![ModelChoice {
                provider: "openai".to_string(),
                model: "gpt-4".to_string(),
            }],
            status: RequestStatus::Pending,
            created_at: Utc::now(),
        };
        store.create(&request).await.unwrap();
        store
            .set_status("r1", RequestStatus::Completed)
            .await
            .unwrap();

        let row: (String, String) =
            sqlx::query_as("SELECT status, models FROM requests WHERE request_id = ?")
                .bind("r1")
                .fetch_one(&pool.reader)
                .await
                .unwrap();
        assert_eq!(row.0, "completed");
        let models: Vec<ModelChoice> = serde_json::from_str(&row.1).unwrap();
        assert_eq!(models[0].model, "gpt-4");

        assert!(matches!(
            store.set_status("missing", RequestStatus::Failed).await,
            Err(RepositoryError::NotFound)
        ));
    }
}
