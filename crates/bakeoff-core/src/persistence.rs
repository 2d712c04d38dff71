//! Persistence trait seam between the buffer and the storage layer.

use bakeoff_types::error::{PersistError, PersistOutcome};
use bakeoff_types::token::Token;

/// Sink for frozen token batches.
///
/// The production implementation (in `bakeoff-infra`) tries the database
/// first and falls back to the WAL; `Deferred` means the batch is durable on
/// disk and the replay loop will complete the database write later. Both
/// outcomes are success for the streaming path.
pub trait PersistenceBackend: Send + Sync {
    fn persist(
        &self,
        batch: Vec<Token>,
    ) -> impl std::future::Future<Output = Result<PersistOutcome, PersistError>> + Send;
}
