//! Provider adaptor trait and model registry.
//!
//! Every vendor's streaming API is wrapped into one contract: a lazy finite
//! sequence of raw token strings whose errors are already classified. The
//! trait returns a boxed stream so adaptors stay object-safe behind
//! `Arc<dyn ProviderAdaptor>`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use bakeoff_types::error::ProviderError;

/// A lazy finite sequence of raw token strings from one provider call.
///
/// The sequence terminates on end-of-stream or on the first error. Adaptors
/// are single-shot: retry is handled above them by opening a new stream.
pub type RawTokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Per-request context flowing down into adaptors.
///
/// Cancellation propagates from the caller (client disconnect or shutdown)
/// into the provider stream; adaptors must stop consuming bytes promptly when
/// the token fires.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl RequestCtx {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context whose cancellation chains off an outer token (e.g. the
    /// process-wide shutdown token).
    pub fn with_parent(request_id: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: parent.child_token(),
        }
    }
}

/// Uniform streaming interface over one vendor.
pub trait ProviderAdaptor: Send + Sync {
    /// Provider name, e.g. "openai".
    fn provider(&self) -> &str;

    /// Open a fresh raw token stream for `(model, prompt)`.
    fn stream_raw(&self, model: &str, prompt: &str, ctx: &RequestCtx) -> RawTokenStream;
}

/// Maps model ids to providers and providers to adaptor instances.
#[derive(Default)]
pub struct ProviderRegistry {
    adaptors: HashMap<String, Arc<dyn ProviderAdaptor>>,
    models: HashMap<String, String>,
    /// First model registered per provider, used by the breaker probe.
    probe_models: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adaptor together with the model ids it serves.
    pub fn register(&mut self, adaptor: Arc<dyn ProviderAdaptor>, models: &[&str]) {
        let provider = adaptor.provider().to_string();
        for model in models {
            self.models.insert((*model).to_string(), provider.clone());
        }
        if let Some(first) = models.first() {
            self.probe_models
                .entry(provider.clone())
                .or_insert_with(|| (*first).to_string());
        }
        self.adaptors.insert(provider, adaptor);
    }

    /// Provider name for a model id, if known.
    pub fn provider_of(&self, model: &str) -> Option<&str> {
        self.models.get(model).map(String::as_str)
    }

    /// Resolve a model id to its provider name and adaptor.
    pub fn resolve(&self, model: &str) -> Option<(String, Arc<dyn ProviderAdaptor>)> {
        let provider = self.models.get(model)?;
        let adaptor = self.adaptors.get(provider)?;
        Some((provider.clone(), Arc::clone(adaptor)))
    }

    /// Adaptor and probe model for a provider (for breaker probes).
    pub fn probe_target(&self, provider: &str) -> Option<(Arc<dyn ProviderAdaptor>, String)> {
        let adaptor = self.adaptors.get(provider)?;
        let model = self.probe_models.get(provider)?;
        Some((Arc::clone(adaptor), model.clone()))
    }

    /// All registered provider names.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adaptors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_stream::stream;

    struct NullAdaptor {
        name: &'static str,
    }

    impl ProviderAdaptor for NullAdaptor {
        fn provider(&self) -> &str {
            self.name
        }

        fn stream_raw(&self, _model: &str, _prompt: &str, _ctx: &RequestCtx) -> RawTokenStream {
            Box::pin(stream! {
                yield Ok("hi".to_string());
            })
        }
    }

    #[test]
    fn registry_resolves_models_to_providers() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            Arc::new(NullAdaptor { name: "openai" }),
            &["gpt-4", "gpt-3.5-turbo"],
        );
        registry.register(Arc::new(NullAdaptor { name: "anthropic" }), &["claude-haiku"]);

        assert_eq!(registry.provider_of("gpt-4"), Some("openai"));
        assert_eq!(registry.provider_of("claude-haiku"), Some("anthropic"));
        assert_eq!(registry.provider_of("mystery-model"), None);

        let (provider, adaptor) = registry.resolve("gpt-3.5-turbo").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(adaptor.provider(), "openai");
    }

    #[test]
    fn probe_target_uses_first_registered_model() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            Arc::new(NullAdaptor { name: "openai" }),
            &["gpt-3.5-turbo", "gpt-4"],
        );
        let (_, model) = registry.probe_target("openai").unwrap();
        assert_eq!(model, "gpt-3.5-turbo");
        assert!(registry.probe_target("cohere").is_none());
    }

    #[test]
    fn providers_are_sorted() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(NullAdaptor { name: "openai" }), &["gpt-4"]);
        registry.register(Arc::new(NullAdaptor { name: "deepseek" }), &["deepseek-chat"]);
        assert_eq!(registry.providers(), vec!["deepseek", "openai"]);
    }
}
