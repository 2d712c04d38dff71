//! POST /api/v1/generate -- drive a comparison request and stream tokens.
//!
//! The handler is the thin intake shim: it validates the prompt bounds,
//! creates the Request row, and hands the stream from the orchestrator to the
//! client as server-sent events. Each token is one `token` event; the stream
//! ends with a single `status` event carrying the terminal outcome marker.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use bakeoff_core::pipeline::PipelineEvent;
use bakeoff_core::provider::RequestCtx;
use bakeoff_core::repository::RequestStore;
use bakeoff_infra::llm::model_to_provider;
use bakeoff_types::token::{ModelChoice, Request, RequestStatus};

use crate::http::error::AppError;
use crate::state::AppState;

/// Prompt length cap in Unicode scalar values.
const MAX_PROMPT_SCALARS: usize = 8_000;

const DEFAULT_MODEL: &str = "gpt-4";

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    /// Model to dispatch first; fallback entries follow on provider failure.
    pub model: Option<String>,
}

pub async fn generate(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<GenerateBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if state.shutdown.is_cancelled() {
        return Err(AppError::Unavailable("shutting down".to_string()));
    }

    let prompt_len = body.prompt.chars().count();
    if prompt_len == 0 {
        return Err(AppError::Validation("prompt must not be empty".to_string()));
    }
    if prompt_len > MAX_PROMPT_SCALARS {
        return Err(AppError::Validation(format!(
            "prompt exceeds {MAX_PROMPT_SCALARS} characters"
        )));
    }

    let model = body.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let provider = model_to_provider(&model)
        .ok_or_else(|| AppError::NotFound(format!("unknown model '{model}'")))?;

    let request = Request {
        request_id: uuid::Uuid::now_v7().to_string(),
        prompt: body.prompt,
        models: vec![ModelChoice {
            provider: provider.to_string(),
            model,
        }],
        status: RequestStatus::Pending,
        created_at: Utc::now(),
    };
    state.requests.create(&request).await?;
    tracing::info!(request_id = %request.request_id, model = %request.models[0].model,
        "request accepted");

    let ctx = RequestCtx::with_parent(request.request_id.clone(), &state.shutdown);
    let stream = state.pipeline.run(request, ctx).map(|event| {
        let sse_event = match event {
            PipelineEvent::Token(token) => Event::default()
                .event("token")
                .json_data(&token)
                .unwrap_or_else(|_| Event::default().event("token").data(token.text)),
            PipelineEvent::Done(outcome) => {
                Event::default().event("status").data(outcome.to_string())
            }
        };
        Ok(sse_event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
