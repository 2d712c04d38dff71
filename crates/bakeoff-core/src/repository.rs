//! Repository trait seams for the Request and Attempt records.
//!
//! Implemented by `bakeoff-infra` over sqlx. The orchestrator only needs
//! create/terminal-transition operations; everything else (gap scan, counts,
//! pruning) is reached through the concrete infra types.

use bakeoff_types::error::RepositoryError;
use bakeoff_types::token::{Attempt, AttemptStatus, Request, RequestStatus};

/// Store for per-model streaming attempts.
pub trait AttemptStore: Send + Sync {
    /// Insert a new attempt row (status `streaming`).
    fn create(
        &self,
        attempt: &Attempt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Terminal transition: set status, end time, and optional error kind.
    fn finish(
        &self,
        request_id: &str,
        attempt_seq: u32,
        status: AttemptStatus,
        error_kind: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

/// Store for comparison requests.
pub trait RequestStore: Send + Sync {
    fn create(
        &self,
        request: &Request,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn set_status(
        &self,
        request_id: &str,
        status: RequestStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
