//! GET /api/v1/status and /api/v1/health -- the read-only admin surface.

use axum::Json;
use axum::extract::State;
use serde_json::json;

use bakeoff_types::status::StatusSnapshot;

use crate::state::AppState;

/// Full core snapshot: circuit states, permits, buffers, WAL, gap flag.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status_snapshot().await)
}

/// Liveness plus database reachability.
pub async fn get_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database_up = state.persistence.db_is_up().await;
    Json(json!({
        "status": if database_up { "ok" } else { "degraded" },
        "database_up": database_up,
        "wal_size_bytes": state.persistence.wal().size_bytes().await,
        "inflight_requests": state.pipeline.inflight(),
    }))
}
