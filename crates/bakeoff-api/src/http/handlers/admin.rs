//! Admin operations: breaker reset/probe, forced replay, retention prune.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::json;

use bakeoff_infra::replay::replay_tick;
use bakeoff_types::error::CallError;

use crate::http::error::AppError;
use crate::state::AppState;

/// POST /api/v1/providers/{provider}/reset -- force a breaker closed.
pub async fn reset_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Json<serde_json::Value> {
    state.caller.reset(&provider);
    Json(json!({ "provider": provider, "circuit_state": "closed" }))
}

/// POST /api/v1/providers/{provider}/probe -- run the minimal-completion
/// probe (5 s timeout, no concurrency permit).
pub async fn probe_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let healthy = state.caller.probe(&provider).await.map_err(|e| match e {
        CallError::Fatal(msg) => AppError::NotFound(msg),
        other => AppError::Internal(other.to_string()),
    })?;
    Ok(Json(json!({ "provider": provider, "probe_succeeded": healthy })))
}

/// POST /api/v1/replay -- force an immediate WAL replay pass.
pub async fn force_replay(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = replay_tick(&state.persistence, &state.shutdown)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(json!({ "result": format!("{result:?}") })))
}

#[derive(Debug, Deserialize, Default)]
pub struct PruneBody {
    /// Override of the configured retention window.
    pub days: Option<u32>,
}

/// POST /api/v1/prune -- delete tokens older than the retention window.
/// Invoked by the external prune cron.
pub async fn prune_tokens(
    State(state): State<AppState>,
    body: Option<axum::Json<PruneBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let days = body
        .and_then(|b| b.0.days)
        .unwrap_or(state.config.retention_days);
    let removed = state
        .persistence
        .token_store()
        .prune_older_than(days)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    tracing::info!(days, removed, "token retention prune");
    Ok(Json(json!({ "days": days, "removed": removed })))
}
