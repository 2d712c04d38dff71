//! Per-provider circuit breakers.
//!
//! Each provider has a small state record {closed, open, half-open} read and
//! updated under its own mutex; the breaker itself performs no IO. Half-open
//! admits exactly one call -- that call is the probe, and its recorded
//! outcome decides whether the circuit closes again or re-opens.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use bakeoff_types::error::{CallError, ErrorClass};
use bakeoff_types::status::ProviderStatusInfo;
use bakeoff_types::wal::format_ts;

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a probe.
    pub cooldown: Duration,
    /// Deadline for the minimal-completion probe.
    pub probe_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { open_until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    /// One probe call may be in flight at a time.
    probe_inflight: bool,
    last_failure: Option<DateTime<Utc>>,
    last_probe: Option<DateTime<Utc>>,
    /// Wall-clock mirror of `Open::open_until` for the status surface.
    open_until_wall: Option<DateTime<Utc>>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            probe_inflight: false,
            last_failure: None,
            last_probe: None,
            open_until_wall: None,
        }
    }
}

/// Circuit breakers for a fixed set of providers.
pub struct CircuitBreakers {
    config: BreakerConfig,
    entries: HashMap<String, Mutex<BreakerEntry>>,
}

impl CircuitBreakers {
    pub fn new(providers: &[String], config: BreakerConfig) -> Self {
        let entries = providers
            .iter()
            .map(|p| (p.clone(), Mutex::new(BreakerEntry::new())))
            .collect();
        Self { config, entries }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.config.probe_timeout
    }

    /// Admission check before calling a provider.
    ///
    /// Fails fast with `ProviderDown` while the circuit is open (before
    /// cooldown) and during half-open when the probe slot is taken. On `Ok`
    /// the caller must later record an outcome via [`Self::record_success`],
    /// [`Self::record_failure`], or [`Self::release`].
    pub fn gate(&self, provider: &str) -> Result<(), CallError> {
        let Some(entry) = self.entries.get(provider) else {
            // Unknown providers are not breaker-protected.
            return Ok(());
        };
        let mut entry = entry.lock().expect("breaker mutex poisoned");

        match entry.state {
            CircuitState::Closed { .. } => Ok(()),
            CircuitState::Open { open_until } => {
                if Instant::now() >= open_until {
                    // Cooldown elapsed: this caller becomes the probe.
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_inflight = true;
                    entry.last_probe = Some(Utc::now());
                    entry.open_until_wall = None;
                    tracing::info!(provider, "circuit half-open, admitting probe call");
                    Ok(())
                } else {
                    Err(CallError::ProviderDown {
                        provider: provider.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_inflight {
                    Err(CallError::ProviderDown {
                        provider: provider.to_string(),
                    })
                } else {
                    entry.probe_inflight = true;
                    entry.last_probe = Some(Utc::now());
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit and resets the failure
    /// count.
    pub fn record_success(&self, provider: &str) {
        let Some(entry) = self.entries.get(provider) else {
            return;
        };
        let mut entry = entry.lock().expect("breaker mutex poisoned");
        if matches!(entry.state, CircuitState::HalfOpen) {
            tracing::info!(provider, "probe succeeded, circuit closed");
        }
        entry.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
        entry.probe_inflight = false;
        entry.open_until_wall = None;
    }

    /// Record a failed call.
    ///
    /// Only qualifying classes (timeout, rate limit, provider down) count
    /// toward the threshold; a fatal outcome just releases the probe slot.
    pub fn record_failure(&self, provider: &str, class: ErrorClass) {
        let Some(entry) = self.entries.get(provider) else {
            return;
        };
        let mut entry = entry.lock().expect("breaker mutex poisoned");
        entry.probe_inflight = false;

        if !class.is_qualifying() {
            return;
        }
        entry.last_failure = Some(Utc::now());

        match entry.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let count = consecutive_failures + 1;
                if count >= self.config.failure_threshold {
                    self.open(provider, &mut entry, count);
                } else {
                    entry.state = CircuitState::Closed {
                        consecutive_failures: count,
                    };
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(provider, "probe failed, circuit re-opened");
                self.open(provider, &mut entry, self.config.failure_threshold);
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Clear the probe slot without recording an outcome (cancellation).
    pub fn release(&self, provider: &str) {
        if let Some(entry) = self.entries.get(provider) {
            let mut entry = entry.lock().expect("breaker mutex poisoned");
            entry.probe_inflight = false;
        }
    }

    /// Reserve the probe slot for an explicit probe call. Returns false when
    /// a probe is already in flight.
    pub fn try_begin_probe(&self, provider: &str) -> bool {
        let Some(entry) = self.entries.get(provider) else {
            return false;
        };
        let mut entry = entry.lock().expect("breaker mutex poisoned");
        if entry.probe_inflight {
            return false;
        }
        entry.probe_inflight = true;
        entry.last_probe = Some(Utc::now());
        true
    }

    /// Force a breaker back to closed (admin operation).
    pub fn reset(&self, provider: &str) {
        if let Some(entry) = self.entries.get(provider) {
            let mut entry = entry.lock().expect("breaker mutex poisoned");
            *entry = BreakerEntry::new();
            tracing::info!(provider, "circuit breaker manually reset");
        }
    }

    fn open(&self, provider: &str, entry: &mut BreakerEntry, failures: u32) {
        entry.state = CircuitState::Open {
            open_until: Instant::now() + self.config.cooldown,
        };
        entry.open_until_wall =
            Some(Utc::now() + chrono::Duration::from_std(self.config.cooldown).unwrap_or_default());
        tracing::error!(provider, failures, "circuit breaker opened");
    }

    /// Status rows for all providers, merged with gate occupancy by the
    /// caller.
    pub fn snapshot(&self, provider: &str, inflight: usize, permit_limit: usize) -> ProviderStatusInfo {
        let (circuit_state, consecutive_failures, last_failure, last_probe, open_until) =
            match self.entries.get(provider) {
                Some(entry) => {
                    let entry = entry.lock().expect("breaker mutex poisoned");
                    let (state, failures) = match entry.state {
                        CircuitState::Closed {
                            consecutive_failures,
                        } => ("closed", consecutive_failures),
                        CircuitState::Open { .. } => ("open", self.config.failure_threshold),
                        CircuitState::HalfOpen => ("half_open", self.config.failure_threshold),
                    };
                    (
                        state.to_string(),
                        failures,
                        entry.last_failure.map(|t| format_ts(&t)),
                        entry.last_probe.map(|t| format_ts(&t)),
                        entry.open_until_wall.map(|t| format_ts(&t)),
                    )
                }
                None => ("closed".to_string(), 0, None, None, None),
            };

        ProviderStatusInfo {
            provider: provider.to_string(),
            circuit_state,
            consecutive_failures,
            last_failure,
            last_probe,
            open_until,
            inflight,
            permit_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(&["openai".to_string()], BreakerConfig::default())
    }

    fn breakers_with_cooldown(cooldown: Duration) -> CircuitBreakers {
        CircuitBreakers::new(
            &["openai".to_string()],
            BreakerConfig {
                cooldown,
                ..BreakerConfig::default()
            },
        )
    }

    #[test]
    fn opens_after_three_qualifying_failures() {
        let cb = breakers();
        cb.record_failure("openai", ErrorClass::Timeout);
        cb.record_failure("openai", ErrorClass::RateLimit);
        assert!(cb.gate("openai").is_ok());

        cb.record_failure("openai", ErrorClass::ProviderDown);
        assert!(matches!(
            cb.gate("openai"),
            Err(CallError::ProviderDown { .. })
        ));
    }

    #[test]
    fn fatal_failures_do_not_count() {
        let cb = breakers();
        for _ in 0..5 {
            cb.record_failure("openai", ErrorClass::Fatal);
        }
        assert!(cb.gate("openai").is_ok());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breakers();
        cb.record_failure("openai", ErrorClass::Timeout);
        cb.record_failure("openai", ErrorClass::Timeout);
        cb.record_success("openai");
        cb.record_failure("openai", ErrorClass::Timeout);
        cb.record_failure("openai", ErrorClass::Timeout);
        assert!(cb.gate("openai").is_ok());
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let cb = breakers_with_cooldown(Duration::ZERO);
        for _ in 0..3 {
            cb.record_failure("openai", ErrorClass::Timeout);
        }
        // Cooldown of zero: first gate becomes the probe, second is rejected.
        assert!(cb.gate("openai").is_ok());
        assert!(cb.gate("openai").is_err());
    }

    #[test]
    fn probe_success_closes_circuit() {
        let cb = breakers_with_cooldown(Duration::ZERO);
        for _ in 0..3 {
            cb.record_failure("openai", ErrorClass::Timeout);
        }
        assert!(cb.gate("openai").is_ok());
        cb.record_success("openai");
        assert!(cb.gate("openai").is_ok());
        assert_eq!(
            cb.snapshot("openai", 0, 5).circuit_state,
            "closed".to_string()
        );
    }

    #[test]
    fn probe_failure_reopens_circuit() {
        let cb = breakers_with_cooldown(Duration::ZERO);
        for _ in 0..3 {
            cb.record_failure("openai", ErrorClass::Timeout);
        }
        assert!(cb.gate("openai").is_ok());
        cb.record_failure("openai", ErrorClass::ProviderDown);
        // Re-opened with zero cooldown: the next gate is a fresh probe, and
        // the one after is rejected again.
        assert!(cb.gate("openai").is_ok());
        assert!(cb.gate("openai").is_err());
    }

    #[test]
    fn open_circuit_rejects_before_cooldown() {
        let cb = breakers_with_cooldown(Duration::from_secs(3600));
        for _ in 0..3 {
            cb.record_failure("openai", ErrorClass::Timeout);
        }
        assert!(cb.gate("openai").is_err());
        assert_eq!(cb.snapshot("openai", 0, 5).circuit_state, "open");
        assert!(cb.snapshot("openai", 0, 5).open_until.is_some());
    }

    #[test]
    fn release_clears_probe_slot_without_outcome() {
        let cb = breakers_with_cooldown(Duration::ZERO);
        for _ in 0..3 {
            cb.record_failure("openai", ErrorClass::Timeout);
        }
        assert!(cb.gate("openai").is_ok());
        cb.release("openai");
        // Slot free again, still half-open.
        assert!(cb.gate("openai").is_ok());
    }

    #[test]
    fn explicit_probe_slot_is_exclusive() {
        let cb = breakers();
        assert!(cb.try_begin_probe("openai"));
        assert!(!cb.try_begin_probe("openai"));
        cb.record_success("openai");
        assert!(cb.try_begin_probe("openai"));
    }

    #[test]
    fn unknown_provider_passes_gate() {
        let cb = breakers();
        assert!(cb.gate("cohere").is_ok());
    }
}
