//! bakeoff service entry point.
//!
//! Boot sequence: tracing, config from env, database + migrations, gap scan,
//! boot-time WAL replay, replay loop, HTTP surface. On SIGINT/SIGTERM the
//! listener stops accepting, in-flight attempts get a bounded grace window,
//! live buffers are drained, the replay loop stops, and the pools close.

mod http;
mod state;

use std::time::Duration;

use bakeoff_infra::replay::ReplayLoop;
use bakeoff_types::config::ServiceConfig;

use state::AppState;

/// Per-buffer bound for the final shutdown drain.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bakeoff_observe::init_tracing().map_err(|e| anyhow::anyhow!("tracing init: {e}"))?;

    let config = ServiceConfig::from_env();
    tracing::info!(
        database_url = %config.database_url,
        wal = %config.wal_file_path.display(),
        "starting bakeoff"
    );

    let state = AppState::init(config.clone()).await?;
    state.boot_checks().await?;

    let replay_handle = ReplayLoop::new(
        std::sync::Arc::clone(&state.persistence),
        Duration::from_secs(config.replay_interval_seconds),
    )
    .spawn(state.shutdown.child_token());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "bakeoff listening");

    let router = http::router::build_router(state.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_sequence(&state).await;
    if let Err(e) = replay_handle.await {
        tracing::warn!(error = %e, "replay loop join failed");
    }
    state.db_pool.close().await;
    tracing::info!("bakeoff stopped");
    Ok(())
}

/// Drain the core after the listener has stopped accepting.
async fn shutdown_sequence(state: &AppState) {
    let grace = Duration::from_secs(state.config.shutdown_grace_seconds);
    tracing::info!(grace_s = grace.as_secs(), "waiting for in-flight attempts");

    let deadline = tokio::time::Instant::now() + grace;
    while state.pipeline.inflight() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let stragglers = state.pipeline.inflight();
    if stragglers > 0 {
        tracing::warn!(stragglers, "grace window elapsed, cancelling remaining attempts");
    }

    // Cancel everything chained off the process token (attempt contexts and
    // the replay loop), then flush whatever the live buffers still hold.
    state.shutdown.cancel();
    state.pipeline.drain_live(SHUTDOWN_DRAIN_DEADLINE).await;
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
