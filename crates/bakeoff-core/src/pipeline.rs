//! Per-request pipeline orchestrator.
//!
//! For each dispatched model the orchestrator creates an Attempt row with a
//! fresh `attempt_seq` and drives one streaming session: safe call -> token
//! builder -> buffer, yielding each raw token to the caller as it is accepted
//! by the buffer. Provider-level failures consult the fallback policy
//! (jitter, new attempt); fatal and persistence failures bubble up; the
//! stream always ends with a trailing status marker.
//!
//! Once the builder has been advanced for an attempt, those indices are
//! persisted or deferred to the WAL. Cancellation is checked before a token
//! is built and between provider reads (inside the safe call), never against
//! the buffer: an in-flight drain always runs to completion.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};

use bakeoff_types::error::{CallError, PersistError, StreamOutcome};
use bakeoff_types::token::{Attempt, AttemptStatus, Request, RequestStatus, Token};

use crate::buffer::BufferManager;
use crate::builder::TokenBuilder;
use crate::fallback::FallbackPolicy;
use crate::persistence::PersistenceBackend;
use crate::provider::RequestCtx;
use crate::repository::{AttemptStore, RequestStore};
use crate::safe_call::SafeCaller;

/// Bound on the best-effort drain after cancellation.
const CANCEL_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Items of the caller-facing stream.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Token(Token),
    /// Trailing status marker; always the last item.
    Done(StreamOutcome),
}

pub type PipelineStream = Pin<Box<dyn Stream<Item = PipelineEvent> + Send>>;

type AttemptKey = (String, u32);

enum AttemptFailure {
    Call(CallError),
    Persist(PersistError),
}

/// Decrements the in-flight request counter when a stream ends or is dropped.
struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Removes the buffer from the live registry when the attempt ends.
struct BufferSlot<P: PersistenceBackend + 'static> {
    buffers: Arc<DashMap<AttemptKey, Arc<BufferManager<P>>>>,
    key: AttemptKey,
}

impl<P: PersistenceBackend + 'static> Drop for BufferSlot<P> {
    fn drop(&mut self) {
        self.buffers.remove(&self.key);
    }
}

/// Wires safe calls, token building, buffering, and fallback per request.
pub struct Pipeline<P, A, R> {
    caller: Arc<SafeCaller>,
    persistence: Arc<P>,
    attempts: Arc<A>,
    requests: Arc<R>,
    fallback: FallbackPolicy,
    live_buffers: Arc<DashMap<AttemptKey, Arc<BufferManager<P>>>>,
    inflight: Arc<AtomicUsize>,
}

impl<P, A, R> Pipeline<P, A, R>
where
    P: PersistenceBackend + 'static,
    A: AttemptStore + 'static,
    R: RequestStore + 'static,
{
    pub fn new(
        caller: Arc<SafeCaller>,
        persistence: Arc<P>,
        attempts: Arc<A>,
        requests: Arc<R>,
        fallback: FallbackPolicy,
    ) -> Self {
        Self {
            caller,
            persistence,
            attempts,
            requests,
            fallback,
            live_buffers: Arc::new(DashMap::new()),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests currently streaming.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Lengths of all live attempt buffers.
    pub fn buffer_lengths(&self) -> Vec<usize> {
        self.live_buffers.iter().map(|entry| entry.len()).collect()
    }

    /// Most recent flush duration across live buffers.
    pub fn last_flush_ms(&self) -> Option<u64> {
        self.live_buffers
            .iter()
            .filter_map(|entry| entry.last_flush_ms())
            .max()
    }

    /// Flush every live buffer, each bounded by `deadline`. Used at shutdown
    /// after the grace window.
    pub async fn drain_live(&self, deadline: Duration) {
        let buffers: Vec<(AttemptKey, Arc<BufferManager<P>>)> = self
            .live_buffers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for ((request_id, attempt_seq), buffer) in buffers {
            match tokio::time::timeout(deadline, buffer.drain_all()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(%request_id, attempt_seq, error = %e, "shutdown drain failed");
                }
                Err(_) => {
                    tracing::error!(%request_id, attempt_seq, "shutdown drain timed out");
                }
            }
        }
    }

    /// Drive a request to a terminal outcome, streaming tokens as they are
    /// accepted by the buffer. The stream ends with `PipelineEvent::Done`.
    pub fn run(&self, request: Request, ctx: RequestCtx) -> PipelineStream {
        let caller = Arc::clone(&self.caller);
        let persistence = Arc::clone(&self.persistence);
        let attempts = Arc::clone(&self.attempts);
        let requests = Arc::clone(&self.requests);
        let fallback = self.fallback.clone();
        let live_buffers = Arc::clone(&self.live_buffers);
        let inflight = Arc::clone(&self.inflight);

        Box::pin(stream! {
            let _inflight = InflightGuard::new(inflight);

            let Some(first) = request.models.first().cloned() else {
                tracing::error!(request_id = %request.request_id, "request carries no models");
                yield PipelineEvent::Done(StreamOutcome::Fatal);
                return;
            };
            if let Err(e) = requests
                .set_status(&request.request_id, RequestStatus::Streaming)
                .await
            {
                tracing::warn!(request_id = %request.request_id, error = %e,
                    "failed to mark request streaming");
            }

            let mut tried: Vec<String> = Vec::new();
            let mut attempt_seq: u32 = 0;
            let mut choice = first;

            let outcome = loop {
                attempt_seq += 1;
                let attempt = Attempt {
                    request_id: request.request_id.clone(),
                    attempt_seq,
                    model_id: choice.model.clone(),
                    provider: choice.provider.clone(),
                    status: AttemptStatus::Streaming,
                    started_at: Utc::now(),
                    ended_at: None,
                    error_kind: None,
                };
                if let Err(e) = attempts.create(&attempt).await {
                    tracing::warn!(request_id = %request.request_id, attempt_seq, error = %e,
                        "failed to create attempt row");
                }
                tracing::info!(request_id = %request.request_id, attempt_seq,
                    model = %choice.model, provider = %choice.provider, "attempt started");

                let key = (request.request_id.clone(), attempt_seq);
                let buffer = Arc::new(BufferManager::new(Arc::clone(&persistence)));
                live_buffers.insert(key.clone(), Arc::clone(&buffer));
                let _slot = BufferSlot {
                    buffers: Arc::clone(&live_buffers),
                    key,
                };

                let mut builder =
                    TokenBuilder::new(&request.request_id, attempt_seq, &choice.model);
                let mut raw = caller.call_model(&choice.model, &request.prompt, &ctx);
                let mut failure: Option<AttemptFailure> = None;

                loop {
                    // Arm the age deadline so a stalled provider cannot keep
                    // a token buffered past the flush bound.
                    let item = match buffer.flush_deadline().await {
                        Some(at) => tokio::select! {
                            item = raw.next() => Some(item),
                            _ = tokio::time::sleep_until(at) => None,
                        },
                        None => Some(raw.next().await),
                    };
                    let Some(item) = item else {
                        if let Err(e) = buffer.drain_all().await {
                            failure = Some(AttemptFailure::Persist(e));
                            break;
                        }
                        continue;
                    };
                    match item {
                        None => break,
                        Some(Ok(text)) => {
                            // Check cancellation before the builder advances:
                            // once a token is built it must reach the buffer,
                            // and an in-flight drain is never aborted.
                            if ctx.cancel.is_cancelled() {
                                failure = Some(AttemptFailure::Call(CallError::Cancelled));
                                break;
                            }
                            let token = builder.build(text);
                            match buffer.add(token.clone()).await {
                                Ok(()) => yield PipelineEvent::Token(token),
                                Err(e) => {
                                    failure = Some(AttemptFailure::Persist(e));
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            failure = Some(AttemptFailure::Call(e));
                            break;
                        }
                    }
                }

                // Flush what the attempt built. After cancellation this is
                // best-effort under a short deadline; after a persistence
                // failure the buffer is already latched.
                let cancelled = matches!(failure, Some(AttemptFailure::Call(CallError::Cancelled)));
                let latched = matches!(failure, Some(AttemptFailure::Persist(_)));
                if cancelled {
                    if tokio::time::timeout(CANCEL_DRAIN_DEADLINE, buffer.drain_all())
                        .await
                        .is_err()
                    {
                        tracing::warn!(request_id = %request.request_id, attempt_seq,
                            "cancellation drain timed out");
                    }
                } else if !latched {
                    if let Err(e) = buffer.drain_all().await {
                        failure = Some(AttemptFailure::Persist(e));
                    }
                }

                match failure {
                    None => {
                        finish_attempt(
                            &*attempts,
                            &request.request_id,
                            attempt_seq,
                            AttemptStatus::Completed,
                            None,
                        )
                        .await;
                        tracing::info!(request_id = %request.request_id, attempt_seq,
                            tokens = builder.built(), "attempt completed");
                        break StreamOutcome::Ok;
                    }
                    Some(AttemptFailure::Call(
                        e @ (CallError::ProviderDown { .. } | CallError::Exhausted { .. }),
                    )) => {
                        let outcome = match &e {
                            CallError::ProviderDown { .. } => StreamOutcome::ProviderDown,
                            _ => StreamOutcome::Exhausted,
                        };
                        finish_attempt(
                            &*attempts,
                            &request.request_id,
                            attempt_seq,
                            AttemptStatus::Failed,
                            Some(&outcome.to_string()),
                        )
                        .await;

                        tried.push(choice.model.clone());
                        let Some(next) = fallback.next(&tried) else {
                            tracing::error!(request_id = %request.request_id,
                                "fallback queue exhausted");
                            break outcome;
                        };
                        let delay = fallback.jitter();
                        tracing::info!(request_id = %request.request_id,
                            failed_model = %choice.model, next_model = %next.model,
                            jitter_ms = delay.as_millis() as u64, "falling back");
                        let cancelled = tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            break StreamOutcome::Cancelled;
                        }
                        choice = next;
                    }
                    Some(AttemptFailure::Call(CallError::Fatal(message))) => {
                        tracing::error!(request_id = %request.request_id, attempt_seq,
                            %message, "fatal provider error");
                        finish_attempt(
                            &*attempts,
                            &request.request_id,
                            attempt_seq,
                            AttemptStatus::Failed,
                            Some("fatal"),
                        )
                        .await;
                        break StreamOutcome::Fatal;
                    }
                    Some(AttemptFailure::Call(CallError::Cancelled)) => {
                        finish_attempt(
                            &*attempts,
                            &request.request_id,
                            attempt_seq,
                            AttemptStatus::Failed,
                            Some("cancelled"),
                        )
                        .await;
                        break StreamOutcome::Cancelled;
                    }
                    Some(AttemptFailure::Persist(e)) => {
                        tracing::error!(request_id = %request.request_id, attempt_seq,
                            error = %e, "persistence failure, cancelling attempt");
                        finish_attempt(
                            &*attempts,
                            &request.request_id,
                            attempt_seq,
                            AttemptStatus::Failed,
                            Some("persistence_failed"),
                        )
                        .await;
                        break StreamOutcome::PersistenceFailed;
                    }
                }
            };

            let request_status = if outcome == StreamOutcome::Ok {
                RequestStatus::Completed
            } else {
                RequestStatus::Failed
            };
            if let Err(e) = requests.set_status(&request.request_id, request_status).await {
                tracing::warn!(request_id = %request.request_id, error = %e,
                    "failed to finalise request status");
            }
            yield PipelineEvent::Done(outcome);
        })
    }
}

async fn finish_attempt<A: AttemptStore>(
    attempts: &A,
    request_id: &str,
    attempt_seq: u32,
    status: AttemptStatus,
    error_kind: Option<&str>,
) {
    if let Err(e) = attempts
        .finish(request_id, attempt_seq, status, error_kind)
        .await
    {
        tracing::warn!(request_id, attempt_seq, error = %e, "failed to finish attempt row");
    }
}
