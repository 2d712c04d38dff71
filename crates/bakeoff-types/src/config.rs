//! Service configuration from environment variables.
//!
//! Malformed values log a warning and fall back to the default rather than
//! aborting startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Providers with built-in concurrency defaults.
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "google_ai", "deepseek"];

/// Default permit limit for a provider's concurrency gate.
pub fn default_concurrency(provider: &str) -> usize {
    if provider == "openai" { 5 } else { 3 }
}

/// Runtime configuration for the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// sqlx connection string for the token store.
    pub database_url: String,
    /// Listen address for the HTTP surface.
    pub bind_addr: String,
    /// Path of the active WAL file.
    pub wal_file_path: PathBuf,
    /// Rotation threshold for the WAL file.
    pub wal_max_size_bytes: u64,
    /// Period of the WAL replay loop.
    pub replay_interval_seconds: u64,
    /// Age beyond which tokens are subject to deletion by the pruner.
    pub retention_days: u32,
    /// Bounded wait for in-flight attempts at shutdown.
    pub shutdown_grace_seconds: u64,
    /// Per-provider overrides of the concurrency gate limit.
    pub concurrency_overrides: HashMap<String, usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/bakeoff.db?mode=rwc".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            wal_file_path: PathBuf::from("data/tokens.wal"),
            wal_max_size_bytes: 100 * 1024 * 1024,
            replay_interval_seconds: 10,
            retention_days: 180,
            shutdown_grace_seconds: 15,
            concurrency_overrides: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut concurrency_overrides = HashMap::new();
        for provider in KNOWN_PROVIDERS {
            let key = format!("{}_CONCURRENCY", provider.to_uppercase());
            if let Some(limit) = env_parse::<usize>(&key) {
                concurrency_overrides.insert(provider.to_string(), limit);
            }
        }

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            wal_file_path: std::env::var("WAL_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.wal_file_path),
            wal_max_size_bytes: env_parse("WAL_MAX_SIZE_BYTES")
                .unwrap_or(defaults.wal_max_size_bytes),
            replay_interval_seconds: env_parse("REPLAY_INTERVAL_SECONDS")
                .unwrap_or(defaults.replay_interval_seconds),
            retention_days: env_parse("RETENTION_DAYS").unwrap_or(defaults.retention_days),
            shutdown_grace_seconds: env_parse("SHUTDOWN_GRACE_SECONDS")
                .unwrap_or(defaults.shutdown_grace_seconds),
            concurrency_overrides,
        }
    }

    /// Effective permit limit for a provider: override or built-in default.
    pub fn concurrency_limit(&self, provider: &str) -> usize {
        self.concurrency_overrides
            .get(provider)
            .copied()
            .unwrap_or_else(|| default_concurrency(provider))
    }
}

/// Read and parse an environment variable, warning on malformed values.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}
