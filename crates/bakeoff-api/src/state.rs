//! Application state wiring the core onto the concrete infra.
//!
//! The core's generics (persistence backend, attempt/request stores) are
//! pinned here to the sqlx/WAL implementations; HTTP handlers and the binary
//! share one cloneable `AppState`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use bakeoff_core::breaker::{BreakerConfig, CircuitBreakers};
use bakeoff_core::fallback::FallbackPolicy;
use bakeoff_core::gate::ConcurrencyGate;
use bakeoff_core::pipeline::Pipeline;
use bakeoff_core::safe_call::SafeCaller;
use bakeoff_infra::llm::registry_from_env;
use bakeoff_infra::persist::PersistenceService;
use bakeoff_infra::replay::replay_tick;
use bakeoff_infra::sqlite::attempt::SqliteAttemptStore;
use bakeoff_infra::sqlite::request::SqliteRequestStore;
use bakeoff_infra::sqlite::token::SqliteTokenStore;
use bakeoff_infra::sqlite::DatabasePool;
use bakeoff_infra::wal::WalLog;
use bakeoff_types::config::ServiceConfig;
use bakeoff_types::status::StatusSnapshot;
use bakeoff_types::wal::format_ts;

/// Gap findings reported at boot (first N, spec default).
const GAP_REPORT_LIMIT: u32 = 10;

/// The pipeline pinned to concrete infra implementations.
pub type AppPipeline = Pipeline<PersistenceService, SqliteAttemptStore, SqliteRequestStore>;

#[derive(Clone)]
pub struct AppState {
    pub config: ServiceConfig,
    pub db_pool: DatabasePool,
    pub persistence: Arc<PersistenceService>,
    pub attempts: Arc<SqliteAttemptStore>,
    pub requests: Arc<SqliteRequestStore>,
    pub caller: Arc<SafeCaller>,
    pub pipeline: Arc<AppPipeline>,
    /// Process-wide shutdown token; request contexts chain off it.
    pub shutdown: CancellationToken,
    /// Set by the boot-time gap scan, exposed on the status snapshot.
    pub token_gap: Arc<AtomicBool>,
}

impl AppState {
    /// Connect to the database, open the WAL, and wire all services.
    pub async fn init(config: ServiceConfig) -> anyhow::Result<Self> {
        let db_pool = DatabasePool::new(&config.database_url).await?;
        let wal = WalLog::new(config.wal_file_path.clone(), config.wal_max_size_bytes).await?;
        let persistence = Arc::new(PersistenceService::new(
            SqliteTokenStore::new(db_pool.clone()),
            wal,
        ));

        let registry = Arc::new(registry_from_env());
        let providers = registry.providers();
        let breakers = Arc::new(CircuitBreakers::new(&providers, BreakerConfig::default()));
        let gate = Arc::new(ConcurrencyGate::new(&config, &providers));
        let caller = Arc::new(SafeCaller::new(registry, breakers, gate));

        let attempts = Arc::new(SqliteAttemptStore::new(db_pool.clone()));
        let requests = Arc::new(SqliteRequestStore::new(db_pool.clone()));

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&caller),
            Arc::clone(&persistence),
            Arc::clone(&attempts),
            Arc::clone(&requests),
            FallbackPolicy::default(),
        ));

        Ok(Self {
            config,
            db_pool,
            persistence,
            attempts,
            requests,
            caller,
            pipeline,
            shutdown: CancellationToken::new(),
            token_gap: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Boot-time consistency checks: gap scan plus one immediate replay pass
    /// to pick up WAL content left behind by the previous run.
    pub async fn boot_checks(&self) -> anyhow::Result<()> {
        let findings = self
            .persistence
            .token_store()
            .scan_gaps(GAP_REPORT_LIMIT)
            .await
            .map_err(|e| anyhow::anyhow!("gap scan failed: {e}"))?;
        if findings.is_empty() {
            tracing::info!("token log gap scan clean");
        } else {
            self.token_gap.store(true, Ordering::Relaxed);
            for gap in &findings {
                tracing::warn!(
                    request_id = %gap.request_id,
                    attempt_seq = gap.attempt_seq,
                    prev_index = gap.prev_index,
                    token_index = gap.token_index,
                    "token index gap detected"
                );
            }
        }

        match replay_tick(&self.persistence, &self.shutdown).await {
            Ok(result) => tracing::info!(?result, "boot-time wal replay"),
            Err(e) => tracing::warn!(error = %e, "boot-time wal replay failed"),
        }
        Ok(())
    }

    /// Read-only snapshot for the admin surface.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let attempts_total = self.attempts.count_total().await.unwrap_or(-1);
        StatusSnapshot {
            providers: self.caller.provider_status(),
            buffer_lengths: self.pipeline.buffer_lengths(),
            last_flush_ms: self
                .pipeline
                .last_flush_ms()
                .or_else(|| self.persistence.last_flush_ms()),
            wal_size_bytes: self.persistence.wal().size_bytes().await,
            last_db_write: self.persistence.last_db_write().map(|t| format_ts(&t)),
            token_gap: self.token_gap.load(Ordering::Relaxed),
            attempts_total,
        }
    }
}
