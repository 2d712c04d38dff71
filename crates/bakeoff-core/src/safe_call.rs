//! Safe provider calls: breaker + gate + retry envelope around raw streams.
//!
//! `call_model` is the single entry point the orchestrator uses to stream raw
//! tokens "with safety": the circuit breaker is consulted first, a
//! concurrency permit is held for the whole stream (released on every exit
//! path, including drop), and transient transport errors are retried with
//! exponential backoff. Tokens yielded before a mid-stream failure still
//! reach the caller; a failed stream is never resumed in-call because that
//! would break index monotonicity -- cross-model fallback is the
//! orchestrator's decision.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};

use bakeoff_types::error::{CallError, ErrorClass, ProviderError};
use bakeoff_types::status::ProviderStatusInfo;

use crate::breaker::CircuitBreakers;
use crate::gate::ConcurrencyGate;
use crate::provider::{ProviderRegistry, RequestCtx};

/// Total tries per call (1 initial + 2 retries).
const MAX_TRIES: u32 = 3;

/// Base of the retry backoff: 1.5^n seconds for n = 1, 2, ...
const BACKOFF_BASE: f64 = 1.5;

/// Prompt used by the minimal-completion breaker probe.
const PROBE_PROMPT: &str = "ping";

/// Raw token stream with call-level errors.
pub type SafeCallStream = Pin<Box<dyn Stream<Item = Result<String, CallError>> + Send>>;

/// Releases the breaker probe slot if the call ends without recording an
/// outcome (consumer dropped the stream mid-flight).
struct GatePass {
    breakers: Arc<CircuitBreakers>,
    provider: String,
    armed: bool,
}

impl GatePass {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GatePass {
    fn drop(&mut self) {
        if self.armed {
            self.breakers.release(&self.provider);
        }
    }
}

/// Composes the provider registry, circuit breakers, and concurrency gate.
pub struct SafeCaller {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakers>,
    gate: Arc<ConcurrencyGate>,
}

impl SafeCaller {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakers>,
        gate: Arc<ConcurrencyGate>,
    ) -> Self {
        Self {
            registry,
            breakers,
            gate,
        }
    }

    /// Stream raw tokens from `model` with breaker, gate, and retry safety.
    ///
    /// Fails with `ProviderDown` (breaker open or provider unreachable),
    /// `Fatal` (non-retryable provider response or unknown model),
    /// `Exhausted` (retry budget spent), or `Cancelled`.
    pub fn call_model(&self, model: &str, prompt: &str, ctx: &RequestCtx) -> SafeCallStream {
        let model = model.to_string();
        let prompt = prompt.to_string();
        let ctx = ctx.clone();
        let registry = Arc::clone(&self.registry);
        let breakers = Arc::clone(&self.breakers);
        let gate = Arc::clone(&self.gate);

        Box::pin(try_stream! {
            let (provider, adaptor) = registry
                .resolve(&model)
                .ok_or_else(|| CallError::Fatal(format!("unknown model '{model}'")))?;

            breakers.gate(&provider)?;
            let mut pass = GatePass {
                breakers: Arc::clone(&breakers),
                provider: provider.clone(),
                armed: true,
            };
            let _permit = gate.acquire(&provider).await?;

            let mut tries = 0u32;
            loop {
                tries += 1;
                let mut yielded = false;
                let mut raw = adaptor.stream_raw(&model, &prompt, &ctx);

                let failure = loop {
                    let item = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => None,
                        item = raw.next() => Some(item),
                    };
                    let item = match item {
                        None => {
                            // GatePass releases the probe slot on drop.
                            Err::<(), CallError>(CallError::Cancelled)?;
                            unreachable!()
                        }
                        Some(item) => item,
                    };
                    match item {
                        None => {
                            pass.disarm();
                            breakers.record_success(&provider);
                            tracing::debug!(%model, %provider, "stream completed");
                            return;
                        }
                        Some(Ok(text)) => {
                            yielded = true;
                            yield text;
                        }
                        Some(Err(e)) => break e,
                    }
                };

                let Some(class) = failure.class() else {
                    Err::<(), CallError>(CallError::Cancelled)?;
                    unreachable!()
                };

                pass.disarm();
                breakers.record_failure(&provider, class);

                match class {
                    ErrorClass::Fatal => {
                        Err::<(), CallError>(CallError::Fatal(failure.to_string()))?;
                    }
                    ErrorClass::ProviderDown => {
                        tracing::warn!(%model, %provider, error = %failure, "provider down");
                        Err::<(), CallError>(CallError::ProviderDown {
                            provider: provider.clone(),
                        })?;
                    }
                    ErrorClass::RateLimit | ErrorClass::Timeout => {
                        // Mid-stream failures cannot be retried in-call:
                        // resuming would break index continuity.
                        if yielded || tries >= MAX_TRIES {
                            Err::<(), CallError>(CallError::Exhausted {
                                provider: provider.clone(),
                                last: failure.to_string(),
                            })?;
                        }
                        let backoff =
                            Duration::from_secs_f64(BACKOFF_BASE.powi(tries as i32));
                        tracing::warn!(
                            %model,
                            %provider,
                            tries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %failure,
                            "transient provider error, retrying"
                        );
                        let cancelled = tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => true,
                            _ = tokio::time::sleep(backoff) => false,
                        };
                        if cancelled {
                            Err::<(), CallError>(CallError::Cancelled)?;
                        }
                        // Re-arm: the next try records its own outcome.
                        pass.armed = true;
                    }
                }
            }
        })
    }

    /// Run the minimal-completion probe against `provider`.
    ///
    /// Bypasses the concurrency gate, bounded by the breaker's probe timeout.
    /// Returns `Ok(false)` when another probe is already in flight or the
    /// probe failed; the breaker state is updated either way.
    pub async fn probe(&self, provider: &str) -> Result<bool, CallError> {
        let (adaptor, model) = self
            .registry
            .probe_target(provider)
            .ok_or_else(|| CallError::Fatal(format!("unknown provider '{provider}'")))?;

        if !self.breakers.try_begin_probe(provider) {
            return Ok(false);
        }

        let ctx = RequestCtx::new(format!("probe-{provider}"));
        let result = tokio::time::timeout(self.breakers.probe_timeout(), async {
            let mut raw = adaptor.stream_raw(&model, PROBE_PROMPT, &ctx);
            while let Some(item) = raw.next().await {
                item?;
            }
            Ok::<(), ProviderError>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.breakers.record_success(provider);
                tracing::info!(provider, "probe succeeded");
                Ok(true)
            }
            Ok(Err(e)) => {
                let class = e.class().unwrap_or(ErrorClass::ProviderDown);
                self.breakers.record_failure(provider, class);
                tracing::warn!(provider, error = %e, "probe failed");
                Ok(false)
            }
            Err(_) => {
                self.breakers.record_failure(provider, ErrorClass::Timeout);
                tracing::warn!(provider, "probe timed out");
                Ok(false)
            }
        }
    }

    /// Force a provider's breaker back to closed (admin operation).
    pub fn reset(&self, provider: &str) {
        self.breakers.reset(provider);
    }

    /// Status rows for every registered provider.
    pub fn provider_status(&self) -> Vec<ProviderStatusInfo> {
        self.registry
            .providers()
            .iter()
            .map(|provider| {
                self.breakers.snapshot(
                    provider,
                    self.gate.inflight(provider),
                    self.gate.limit(provider),
                )
            })
            .collect()
    }
}
