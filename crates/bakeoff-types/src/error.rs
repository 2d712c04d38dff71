//! Error enums for the provider, call, and persistence layers.
//!
//! Provider errors carry their classification so upper layers never depend on
//! vendor error types. The call and persistence enums mirror the propagation
//! policy: the safe-call layer absorbs retryable transport errors, the
//! persistence service absorbs DB unavailability into the WAL, and the
//! orchestrator sees at most one terminal outcome per attempt.

use std::fmt;

use thiserror::Error;

/// Deterministic classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Timeout,
    ProviderDown,
    Fatal,
}

impl ErrorClass {
    /// Whether this class counts toward the circuit-breaker threshold.
    pub fn is_qualifying(self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimit | ErrorClass::Timeout | ErrorClass::ProviderDown
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::RateLimit => write!(f, "rate_limit"),
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::ProviderDown => write!(f, "provider_down"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Classify a well-known HTTP status into an [`ErrorClass`].
///
/// 429 is a rate limit, 408/504 are timeouts, the remaining 5xx are
/// provider-down, and the request-shaped 4xx are fatal. Anything else is
/// treated as provider-down so it stays retry-visible to the breaker.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimit,
        408 | 504 => ErrorClass::Timeout,
        500..=599 => ErrorClass::ProviderDown,
        400 | 401 | 403 | 404 | 422 => ErrorClass::Fatal,
        _ => ErrorClass::ProviderDown,
    }
}

/// Errors surfaced by provider adaptors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited by {provider} (retry after {retry_after_ms:?}ms)")]
    RateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    #[error("timeout talking to {provider}")]
    Timeout { provider: String },

    #[error("provider {provider} unavailable: {message}")]
    Down { provider: String, message: String },

    #[error("fatal provider error: {0}")]
    Fatal(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Classification, or `None` for cancellation (which is not a provider
    /// failure and never counts for the breaker).
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ProviderError::RateLimited { .. } => Some(ErrorClass::RateLimit),
            ProviderError::Timeout { .. } => Some(ErrorClass::Timeout),
            ProviderError::Down { .. } => Some(ErrorClass::ProviderDown),
            ProviderError::Fatal(_) => Some(ErrorClass::Fatal),
            ProviderError::Cancelled => None,
        }
    }
}

/// Terminal failures of one safe call (`call_model`).
///
/// RateLimit/Timeout are absorbed by the in-call retry envelope and only
/// become visible as `Exhausted` once the budget is spent.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("provider {provider} is down")]
    ProviderDown { provider: String },

    #[error("retry budget exhausted for {provider}: {last}")]
    Exhausted { provider: String, last: String },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

/// Outcome of one database batch write.
#[derive(Debug, Error)]
pub enum DbWriteError {
    /// Connection or transport failure; the caller should WAL-fallback.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    /// Transient conflict worth an immediate re-attempt.
    #[error("retryable database error: {0}")]
    Retryable(String),

    /// Local storage is out of space; nothing to fall back to.
    #[error("database disk fatal: {0}")]
    FatalDisk(String),
}

/// Errors from the write-ahead log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal disk full: {0}")]
    DiskFull(String),

    #[error("wal io error: {0}")]
    Io(String),

    #[error("corrupt wal line: {0}")]
    Corrupt(String),
}

/// Result of persisting one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Batch committed to the database.
    Persisted,
    /// Batch redirected to the WAL; replay will complete the write later.
    Deferred,
}

/// Fatal persistence failure: neither the database nor the WAL accepted the
/// batch. Cancels the attempt and surfaces to the caller.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("persistence failed: {0}")]
    Failed(String),
}

/// Errors from repository operations (trait seams defined in bakeoff-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,
}

/// Trailing status marker for a streaming request, also recorded on the
/// Attempt row as `error_kind` for non-ok outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Ok,
    ProviderDown,
    Exhausted,
    Fatal,
    Cancelled,
    PersistenceFailed,
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOutcome::Ok => write!(f, "ok"),
            StreamOutcome::ProviderDown => write!(f, "provider_down"),
            StreamOutcome::Exhausted => write!(f, "exhausted"),
            StreamOutcome::Fatal => write!(f, "fatal"),
            StreamOutcome::Cancelled => write!(f, "cancelled"),
            StreamOutcome::PersistenceFailed => write!(f, "persistence_failed"),
        }
    }
}
