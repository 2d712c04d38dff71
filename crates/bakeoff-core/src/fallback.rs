//! Cross-model fallback policy.
//!
//! A fixed ordered list of alternate {provider, model} entries, tried after a
//! provider-level failure (ProviderDown or retry exhaustion -- never Fatal).
//! A uniform jitter in [1 s, 3 s] is applied before re-entry so a popular
//! fallback target does not get hammered in lockstep.

use std::time::Duration;

use rand::Rng;

use bakeoff_types::token::ModelChoice;

/// Jitter bounds before a fallback attempt starts.
const JITTER_MIN_MS: u64 = 1_000;
const JITTER_MAX_MS: u64 = 3_000;

/// Ordered alternate-model queue.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    queue: Vec<ModelChoice>,
}

impl Default for FallbackPolicy {
    /// A small, fast model from each major provider.
    fn default() -> Self {
        let entry = |provider: &str, model: &str| ModelChoice {
            provider: provider.to_string(),
            model: model.to_string(),
        };
        Self {
            queue: vec![
                entry("openai", "gpt-3.5-turbo"),
                entry("anthropic", "claude-haiku"),
                entry("google_ai", "gemini-flash"),
                entry("deepseek", "deepseek-chat"),
            ],
        }
    }
}

impl FallbackPolicy {
    pub fn new(queue: Vec<ModelChoice>) -> Self {
        Self { queue }
    }

    /// First entry whose model has not been tried yet, or `None` when the
    /// queue is exhausted.
    pub fn next(&self, already_tried: &[String]) -> Option<ModelChoice> {
        self.queue
            .iter()
            .find(|choice| !already_tried.iter().any(|m| *m == choice.model))
            .cloned()
    }

    /// Uniform jitter delay in [1 s, 3 s].
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(rand::rng().random_range(JITTER_MIN_MS..=JITTER_MAX_MS))
    }

    pub fn queue(&self) -> &[ModelChoice] {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_skips_already_tried_models() {
        let policy = FallbackPolicy::default();

        let first = policy.next(&[]).unwrap();
        assert_eq!(first.model, "gpt-3.5-turbo");

        let tried = vec!["gpt-4".to_string(), "gpt-3.5-turbo".to_string()];
        let next = policy.next(&tried).unwrap();
        assert_eq!(next.model, "claude-haiku");
        assert_eq!(next.provider, "anthropic");
    }

    #[test]
    fn exhausted_queue_returns_none() {
        let policy = FallbackPolicy::default();
        let tried: Vec<String> = policy
            .queue()
            .iter()
            .map(|choice| choice.model.clone())
            .collect();
        assert!(policy.next(&tried).is_none());
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = FallbackPolicy::default();
        for _ in 0..100 {
            let delay = policy.jitter();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }
}
