//! Versioned API router.

use axum::Router;
use axum::routing::{get, post};

use crate::http::handlers::{admin, generate, status};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/generate", post(generate::generate))
        .route("/api/v1/status", get(status::get_status))
        .route("/api/v1/health", get(status::get_health))
        .route(
            "/api/v1/providers/{provider}/reset",
            post(admin::reset_provider),
        )
        .route(
            "/api/v1/providers/{provider}/probe",
            post(admin::probe_provider),
        )
        .route("/api/v1/replay", post(admin::force_replay))
        .route("/api/v1/prune", post(admin::prune_tokens))
        .with_state(state)
}
