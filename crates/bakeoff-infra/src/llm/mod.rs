//! Concrete provider adaptors and registry wiring.
//!
//! Every provider is reached through an OpenAI-compatible chat-completions
//! SSE endpoint (vendors either expose one natively or are fronted by a
//! compatibility gateway). Base URLs can be overridden per provider with
//! `{PROVIDER}_BASE_URL`; API keys come from `{PROVIDER}_API_KEY`.

pub mod sse;

use std::sync::Arc;

use secrecy::SecretString;

use bakeoff_core::provider::ProviderRegistry;

use self::sse::SseChatAdaptor;

/// Static model -> provider routing table.
pub fn model_to_provider(model: &str) -> Option<&'static str> {
    match model {
        "gpt-4" | "gpt-4-turbo" | "gpt-3.5-turbo" => Some("openai"),
        "claude-3-opus" | "claude-3-sonnet" | "claude-haiku" => Some("anthropic"),
        "gemini-pro" | "gemini-flash" => Some("google_ai"),
        "deepseek-chat" | "deepseek-coder" => Some("deepseek"),
        _ => None,
    }
}

struct Endpoint {
    provider: &'static str,
    default_base_url: &'static str,
    models: &'static [&'static str],
}

const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        provider: "openai",
        default_base_url: "https://api.openai.com",
        models: &["gpt-3.5-turbo", "gpt-4", "gpt-4-turbo"],
    },
    Endpoint {
        provider: "anthropic",
        default_base_url: "https://api.anthropic.com",
        models: &["claude-haiku", "claude-3-sonnet", "claude-3-opus"],
    },
    Endpoint {
        provider: "google_ai",
        default_base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        models: &["gemini-flash", "gemini-pro"],
    },
    Endpoint {
        provider: "deepseek",
        default_base_url: "https://api.deepseek.com",
        models: &["deepseek-chat", "deepseek-coder"],
    },
];

/// Build the provider registry from the environment.
///
/// Providers without an API key are left unregistered: calls to their models
/// fail fast as unknown instead of burning retries on guaranteed 401s.
pub fn registry_from_env() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for endpoint in ENDPOINTS {
        let key_var = format!("{}_API_KEY", endpoint.provider.to_uppercase());
        let Ok(api_key) = std::env::var(&key_var) else {
            tracing::warn!(
                provider = endpoint.provider,
                "no api key in environment, provider not registered"
            );
            continue;
        };
        let base_url_var = format!("{}_BASE_URL", endpoint.provider.to_uppercase());
        let base_url =
            std::env::var(&base_url_var).unwrap_or_else(|_| endpoint.default_base_url.to_string());

        let adaptor = SseChatAdaptor::new(
            endpoint.provider,
            base_url,
            SecretString::from(api_key),
        );
        registry.register(Arc::new(adaptor), endpoint.models);
        tracing::info!(
            provider = endpoint.provider,
            models = endpoint.models.len(),
            "provider registered"
        );
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_routing_table() {
        assert_eq!(model_to_provider("gpt-4"), Some("openai"));
        assert_eq!(model_to_provider("gpt-3.5-turbo"), Some("openai"));
        assert_eq!(model_to_provider("claude-haiku"), Some("anthropic"));
        assert_eq!(model_to_provider("gemini-flash"), Some("google_ai"));
        assert_eq!(model_to_provider("deepseek-chat"), Some("deepseek"));
        assert_eq!(model_to_provider("made-up-model"), None);
    }

    #[test]
    fn every_routed_model_has_an_endpoint() {
        for endpoint in ENDPOINTS {
            for model in endpoint.models {
                assert_eq!(model_to_provider(model), Some(endpoint.provider));
            }
        }
    }
}
