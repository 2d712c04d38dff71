//! Background WAL replay loop.
//!
//! Wakes on a fixed period, and when the database is reachable drains the WAL
//! into it in batches, then truncates. A tick that hits database
//! unavailability aborts and leaves the WAL intact; the primary key makes
//! overlap with late live writes harmless. On shutdown the loop finishes its
//! current batch and exits before truncating -- the next boot completes the
//! remaining work.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bakeoff_types::error::{DbWriteError, WalError};
use bakeoff_types::token::Token;
use bakeoff_types::wal::WalRecord;

use crate::persist::PersistenceService;

/// Tokens per replay insert batch.
const REPLAY_BATCH_SIZE: usize = 16;

/// What one replay tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// Database down or WAL empty; nothing attempted.
    Skipped,
    /// Every line written and the WAL truncated.
    Completed { replayed: usize },
    /// Database went away (or shutdown fired) mid-pass; WAL left intact.
    Aborted { replayed: usize },
}

pub struct ReplayLoop {
    service: Arc<PersistenceService>,
    interval: Duration,
}

impl ReplayLoop {
    pub fn new(service: Arc<PersistenceService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Spawn the periodic loop; it stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_s = self.interval.as_secs(), "wal replay loop started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so boot-time
            // replay ordering stays with the caller.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match replay_tick(&self.service, &cancel).await {
                            Ok(TickResult::Completed { replayed }) if replayed > 0 => {
                                tracing::info!(replayed, "wal replay tick completed");
                            }
                            Ok(TickResult::Aborted { replayed }) => {
                                tracing::warn!(replayed, "wal replay tick aborted, wal intact");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "wal replay tick failed");
                            }
                        }
                    }
                }
            }
            tracing::info!("wal replay loop stopped");
        })
    }
}

/// Run one replay pass. Exposed separately so boot and the admin surface can
/// force an immediate replay.
pub async fn replay_tick(
    service: &PersistenceService,
    cancel: &CancellationToken,
) -> Result<TickResult, WalError> {
    if !service.db_is_up().await {
        tracing::debug!("database not reachable, skipping replay tick");
        return Ok(TickResult::Skipped);
    }
    if service.wal().size_bytes().await == 0 {
        return Ok(TickResult::Skipped);
    }

    let Some(mut lines) = service.wal().read_lines().await? else {
        return Ok(TickResult::Skipped);
    };

    let mut batch = Vec::with_capacity(REPLAY_BATCH_SIZE);
    let mut replayed = 0usize;
    let mut corrupt = 0usize;

    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| WalError::Io(e.to_string()))?;
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match WalRecord::parse_line(&line).and_then(WalRecord::into_token) {
            Ok(token) => batch.push(token),
            Err(e) => {
                corrupt += 1;
                tracing::warn!(error = %e, "skipping corrupt wal line");
            }
        }
        if batch.len() >= REPLAY_BATCH_SIZE {
            match write_batch(service, &mut batch).await {
                Ok(written) => replayed += written,
                Err(()) => return Ok(TickResult::Aborted { replayed }),
            }
            if cancel.is_cancelled() {
                // Finish the current batch only; truncation waits for the
                // next boot.
                return Ok(TickResult::Aborted { replayed });
            }
        }
    }

    if !batch.is_empty() {
        match write_batch(service, &mut batch).await {
            Ok(written) => replayed += written,
            Err(()) => return Ok(TickResult::Aborted { replayed }),
        }
    }

    service.wal().truncate().await?;
    service.wal().rotate_if_needed().await?;
    if corrupt > 0 {
        tracing::warn!(corrupt, "dropped corrupt wal lines during replay");
    }
    Ok(TickResult::Completed { replayed })
}

async fn write_batch(
    service: &PersistenceService,
    batch: &mut Vec<Token>,
) -> Result<usize, ()> {
    let count = batch.len();
    match service.token_store().copy_batch(batch).await {
        Ok(()) => {
            service.record_db_write();
            batch.clear();
            Ok(count)
        }
        Err(e @ (DbWriteError::Unavailable(_) | DbWriteError::Retryable(_))) => {
            tracing::warn!(error = %e, "database lost mid-replay");
            Err(())
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal database error during replay");
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::sqlite::token::SqliteTokenStore;
    use crate::sqlite::DatabasePool;
    use crate::wal::WalLog;

    async fn service(dir: &tempfile::TempDir) -> (Arc<PersistenceService>, DatabasePool) {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let wal = WalLog::new(dir.path().join("tokens.wal"), 1024 * 1024)
            .await
            .unwrap();
        (
            Arc::new(PersistenceService::new(
                SqliteTokenStore::new(pool.clone()),
                wal,
            )),
            pool,
        )
    }

    fn tokens(request_id: &str, n: u32) -> Vec<Token> {
        (0..n)
            .map(|i| Token {
                request_id: request_id.to_string(),
                attempt_seq: 1,
                index: i,
                model_id: "gpt-4".to_string(),
                text: format!("t{i}"),
                ts: Utc::now(),
            })
            .collect()
    }

    async fn db_count(pool: &DatabasePool) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM token_log")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        row.0
    }

    #[tokio::test]
    async fn tick_drains_wal_into_database_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pool) = service(&dir).await;

        service.wal().append(&tokens("r1", 20)).await.unwrap();
        let result = replay_tick(&service, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, TickResult::Completed { replayed: 20 });
        assert_eq!(db_count(&pool).await, 20);
        assert_eq!(service.wal().size_bytes().await, 0);
        assert!(service.last_db_write().is_some());
    }

    #[tokio::test]
    async fn replay_is_idempotent_against_live_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pool) = service(&dir).await;

        let batch = tokens("r1", 8);
        // Half the batch already made it to the database before the outage.
        service.token_store().copy_batch(&batch[..4]).await.unwrap();
        service.wal().append(&batch).await.unwrap();

        let result = replay_tick(&service, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(result, TickResult::Completed { .. }));
        assert_eq!(db_count(&pool).await, 8);

        // A second replay of the same content changes nothing.
        service.wal().append(&batch).await.unwrap();
        replay_tick(&service, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(db_count(&pool).await, 8);
    }

    #[tokio::test]
    async fn empty_wal_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _pool) = service(&dir).await;
        let result = replay_tick(&service, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, TickResult::Skipped);
    }

    #[tokio::test]
    async fn database_down_leaves_wal_intact() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pool) = service(&dir).await;

        service.wal().append(&tokens("r1", 3)).await.unwrap();
        let before = service.wal().size_bytes().await;
        pool.close().await;

        let result = replay_tick(&service, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, TickResult::Skipped);
        assert_eq!(service.wal().size_bytes().await, before);
    }

    #[tokio::test]
    async fn outage_mid_request_loses_no_tokens() {
        use bakeoff_core::persistence::PersistenceBackend;

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        // First half of the request lands in the database normally.
        let pool = DatabasePool::new(&url).await.unwrap();
        let wal = WalLog::new(dir.path().join("tokens.wal"), 1024 * 1024)
            .await
            .unwrap();
        let service = PersistenceService::new(SqliteTokenStore::new(pool.clone()), wal);
        let all = tokens("r1", 20);
        service.persist(all[..8].to_vec()).await.unwrap();

        // Database goes away mid-request: the rest defers to the WAL.
        pool.close().await;
        service.persist(all[8..].to_vec()).await.unwrap();

        // Database recovers (fresh pool over the same file); one replay tick
        // completes the write and empties the WAL.
        let pool2 = DatabasePool::new(&url).await.unwrap();
        let wal2 = WalLog::new(dir.path().join("tokens.wal"), 1024 * 1024)
            .await
            .unwrap();
        let recovered = Arc::new(PersistenceService::new(
            SqliteTokenStore::new(pool2.clone()),
            wal2,
        ));
        let result = replay_tick(&recovered, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, TickResult::Completed { replayed: 12 });

        let indices: Vec<(i64,)> = sqlx::query_as(
            "SELECT token_index FROM token_log WHERE request_id = 'r1' ORDER BY token_index",
        )
        .fetch_all(&pool2.reader)
        .await
        .unwrap();
        assert_eq!(
            indices.iter().map(|r| r.0).collect::<Vec<_>>(),
            (0..20).collect::<Vec<i64>>()
        );
        assert_eq!(recovered.wal().size_bytes().await, 0);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pool) = service(&dir).await;

        service.wal().append(&tokens("r1", 2)).await.unwrap();
        // Hand-corrupt the file with a garbage line in the middle.
        let path = service.wal().path().to_path_buf();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        std::fs::write(&path, content).unwrap();
        service.wal().append(&tokens("r2", 1)).await.unwrap();

        let result = replay_tick(&service, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, TickResult::Completed { replayed: 3 });
        assert_eq!(db_count(&pool).await, 3);
    }
}
