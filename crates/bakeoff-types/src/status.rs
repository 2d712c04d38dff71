//! Read-only status snapshot consumed by the admin surface.

use serde::Serialize;

/// Per-provider safety state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusInfo {
    pub provider: String,
    /// "closed", "open", or "half_open".
    pub circuit_state: String,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub last_probe: Option<String>,
    pub open_until: Option<String>,
    /// Streams currently holding a concurrency permit.
    pub inflight: usize,
    pub permit_limit: usize,
}

/// Point-in-time snapshot of the core for the admin layer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub providers: Vec<ProviderStatusInfo>,
    /// Lengths of the currently live attempt buffers.
    pub buffer_lengths: Vec<usize>,
    pub last_flush_ms: Option<u64>,
    pub wal_size_bytes: u64,
    pub last_db_write: Option<String>,
    /// True when the boot-time gap scan found a hole in any attempt.
    pub token_gap: bool,
    /// Persisted count over the attempts table.
    pub attempts_total: i64,
}
