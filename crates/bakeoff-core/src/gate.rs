//! Per-provider concurrency gate.
//!
//! Bounded admission in front of the raw provider streams so a burst of
//! comparison requests cannot thrash a vendor's rate limits or local sockets.
//! Permits are owned values released on drop, which covers every exit path
//! including cancellation. Acquisition itself does not time out; callers
//! enforce deadlines through their context.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use bakeoff_types::config::ServiceConfig;
use bakeoff_types::error::CallError;

struct ProviderSlot {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Bounded admission per provider (openai: 5, others: 3 by default, with
/// `{PROVIDER}_CONCURRENCY` overrides).
pub struct ConcurrencyGate {
    slots: HashMap<String, ProviderSlot>,
}

impl ConcurrencyGate {
    pub fn new(config: &ServiceConfig, providers: &[String]) -> Self {
        let slots = providers
            .iter()
            .map(|provider| {
                let limit = config.concurrency_limit(provider);
                (
                    provider.clone(),
                    ProviderSlot {
                        semaphore: Arc::new(Semaphore::new(limit)),
                        limit,
                    },
                )
            })
            .collect();
        Self { slots }
    }

    /// Wait for a permit for `provider`. The permit releases on drop.
    pub async fn acquire(&self, provider: &str) -> Result<OwnedSemaphorePermit, CallError> {
        let slot = self
            .slots
            .get(provider)
            .ok_or_else(|| CallError::Fatal(format!("no concurrency gate for '{provider}'")))?;
        slot.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CallError::Fatal(format!("concurrency gate closed for '{provider}'")))
    }

    /// Streams currently holding a permit for `provider`.
    pub fn inflight(&self, provider: &str) -> usize {
        self.slots
            .get(provider)
            .map(|slot| slot.limit - slot.semaphore.available_permits())
            .unwrap_or(0)
    }

    /// Configured permit limit for `provider`.
    pub fn limit(&self, provider: &str) -> usize {
        self.slots.get(provider).map(|slot| slot.limit).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_for(providers: &[&str]) -> ConcurrencyGate {
        let config = ServiceConfig::default();
        let providers: Vec<String> = providers.iter().map(|s| s.to_string()).collect();
        ConcurrencyGate::new(&config, &providers)
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let gate = gate_for(&["anthropic"]);
        assert_eq!(gate.limit("anthropic"), 3);

        let p1 = gate.acquire("anthropic").await.unwrap();
        let _p2 = gate.acquire("anthropic").await.unwrap();
        let _p3 = gate.acquire("anthropic").await.unwrap();
        assert_eq!(gate.inflight("anthropic"), 3);

        // Fourth acquisition must wait until a permit is released.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            gate.acquire("anthropic"),
        )
        .await;
        assert!(pending.is_err(), "fourth permit should not be available");

        drop(p1);
        let _p4 = gate.acquire("anthropic").await.unwrap();
        assert_eq!(gate.inflight("anthropic"), 3);
    }

    #[tokio::test]
    async fn openai_default_is_five() {
        let gate = gate_for(&["openai"]);
        assert_eq!(gate.limit("openai"), 5);
        let _permits: Vec<_> = {
            let mut held = Vec::new();
            for _ in 0..5 {
                held.push(gate.acquire("openai").await.unwrap());
            }
            held
        };
        assert_eq!(gate.inflight("openai"), 5);
    }

    #[tokio::test]
    async fn unknown_provider_is_fatal() {
        let gate = gate_for(&["openai"]);
        assert!(matches!(
            gate.acquire("cohere").await,
            Err(CallError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn override_changes_limit() {
        let mut config = ServiceConfig::default();
        config.concurrency_overrides.insert("openai".to_string(), 1);
        let gate = ConcurrencyGate::new(&config, &["openai".to_string()]);
        assert_eq!(gate.limit("openai"), 1);
        let _p = gate.acquire("openai").await.unwrap();
        assert_eq!(gate.inflight("openai"), 1);
    }
}
