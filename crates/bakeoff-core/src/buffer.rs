//! Single-attempt token buffer with flush triggers and back-pressure.
//!
//! State machine: IDLE (empty) -> BUFFERING (accumulating) -> FLUSHING (batch
//! frozen, drain in progress) -> IDLE. The inner mutex is held across the
//! drain, so `add` suspends while a flush is in progress instead of
//! rejecting. A fatal drain latches the buffer: no further `add` succeeds.
//!
//! Each buffer is owned by exactly one attempt; batches leave by value, so
//! there is no shared mutable state with the persistence layer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use bakeoff_types::error::{PersistError, PersistOutcome};
use bakeoff_types::token::Token;

use crate::persistence::PersistenceBackend;

/// Flush when the buffer reaches this many tokens.
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Flush when the oldest buffered token reaches this age.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(1);

/// Observable buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Buffering,
    Flushing,
}

struct Inner {
    tokens: Vec<Token>,
    first_at: Option<Instant>,
    state: BufferState,
    /// Latched on a fatal drain; the buffer accepts nothing afterwards.
    failed: bool,
    flush_seq: u64,
}

/// Bounded in-memory accumulator for one attempt.
pub struct BufferManager<P> {
    inner: Mutex<Inner>,
    persistence: Arc<P>,
    batch_size: usize,
    max_age: Duration,
    /// Length mirror for the status surface (read without locking).
    len: AtomicUsize,
    /// Duration of the most recent flush in ms, +1 (0 means "none yet").
    last_flush_ms: AtomicU64,
}

impl<P: PersistenceBackend> BufferManager<P> {
    pub fn new(persistence: Arc<P>) -> Self {
        Self::with_limits(persistence, DEFAULT_BATCH_SIZE, DEFAULT_MAX_AGE)
    }

    pub fn with_limits(persistence: Arc<P>, batch_size: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tokens: Vec::with_capacity(batch_size),
                first_at: None,
                state: BufferState::Idle,
                failed: false,
                flush_seq: 0,
            }),
            persistence,
            batch_size,
            max_age,
            len: AtomicUsize::new(0),
            last_flush_ms: AtomicU64::new(0),
        }
    }

    /// Append one token, draining inline when a flush trigger fires.
    ///
    /// Suspends while another drain holds the buffer. Tokens must arrive in
    /// index order; the buffer never reorders them.
    pub async fn add(&self, token: Token) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().await;
        if inner.failed {
            return Err(PersistError::Failed(
                "buffer rejected token after fatal flush".to_string(),
            ));
        }

        debug_assert!(
            inner
                .tokens
                .last()
                .is_none_or(|last| token.index == last.index + 1),
            "non-contiguous token index {}",
            token.index
        );

        inner.tokens.push(token);
        self.len.store(inner.tokens.len(), Ordering::Relaxed);
        if inner.first_at.is_none() {
            inner.first_at = Some(Instant::now());
            inner.state = BufferState::Buffering;
        }

        let size_trigger = inner.tokens.len() >= self.batch_size;
        let age_trigger = inner
            .first_at
            .is_some_and(|first| first.elapsed() >= self.max_age);
        if size_trigger || age_trigger {
            self.drain_locked(&mut inner).await?;
        }
        Ok(())
    }

    /// Flush whatever is buffered, regardless of triggers. Used by the
    /// orchestrator's age deadline, at end-of-stream, and at shutdown.
    pub async fn drain_all(&self) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().await;
        if inner.failed {
            return Err(PersistError::Failed(
                "buffer in failed state".to_string(),
            ));
        }
        self.drain_locked(&mut inner).await
    }

    /// Deadline at which the oldest buffered token hits the age trigger.
    pub async fn flush_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().await;
        inner.first_at.map(|first| first + self.max_age)
    }

    /// Buffered token count (lock-free mirror for the status surface).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Duration of the most recent flush, if any.
    pub fn last_flush_ms(&self) -> Option<u64> {
        match self.last_flush_ms.load(Ordering::Relaxed) {
            0 => None,
            stored => Some(stored - 1),
        }
    }

    pub async fn state(&self) -> BufferState {
        self.inner.lock().await.state
    }

    async fn drain_locked(&self, inner: &mut MutexGuard<'_, Inner>) -> Result<(), PersistError> {
        if inner.tokens.is_empty() {
            return Ok(());
        }

        inner.state = BufferState::Flushing;
        let batch = std::mem::take(&mut inner.tokens);
        let count = batch.len();
        self.len.store(0, Ordering::Relaxed);
        inner.first_at = None;

        let started = Instant::now();
        match self.persistence.persist(batch).await {
            Ok(outcome) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.last_flush_ms.store(elapsed_ms + 1, Ordering::Relaxed);
                inner.flush_seq += 1;
                inner.state = BufferState::Idle;
                match outcome {
                    PersistOutcome::Persisted => {
                        tracing::debug!(count, elapsed_ms, "buffer flushed to database");
                    }
                    PersistOutcome::Deferred => {
                        tracing::warn!(count, elapsed_ms, "buffer flushed to wal (deferred)");
                    }
                }
                Ok(())
            }
            Err(e) => {
                // Stay in FLUSHING with the failed latch set; the attempt is
                // about to be cancelled by the orchestrator.
                inner.failed = true;
                tracing::error!(count, error = %e, "fatal buffer flush failure");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Persist,
        Defer,
        DiskFull,
    }

    struct MockBackend {
        script: StdMutex<VecDeque<Behavior>>,
        batches: StdMutex<Vec<Vec<Token>>>,
    }

    impl MockBackend {
        fn new(script: &[Behavior]) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.iter().copied().collect()),
                batches: StdMutex::new(Vec::new()),
            })
        }

        fn batches(&self) -> Vec<Vec<Token>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl PersistenceBackend for MockBackend {
        async fn persist(&self, batch: Vec<Token>) -> Result<PersistOutcome, PersistError> {
            let behavior = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Behavior::Persist);
            match behavior {
                Behavior::Persist => {
                    self.batches.lock().unwrap().push(batch);
                    Ok(PersistOutcome::Persisted)
                }
                Behavior::Defer => {
                    self.batches.lock().unwrap().push(batch);
                    Ok(PersistOutcome::Deferred)
                }
                Behavior::DiskFull => Err(PersistError::DiskFull("no space".to_string())),
            }
        }
    }

    fn token(index: u32) -> Token {
        Token {
            request_id: "req-1".to_string(),
            attempt_seq: 1,
            index,
            model_id: "gpt-4".to_string(),
            text: format!("t{index}"),
            ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn size_trigger_flushes_full_batch() {
        let backend = MockBackend::new(&[]);
        let buffer = BufferManager::new(Arc::clone(&backend));

        for i in 0..16 {
            buffer.add(token(i)).await.unwrap();
        }

        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 16);
        assert!(buffer.is_empty());
        assert_eq!(buffer.state().await, BufferState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn age_trigger_flushes_small_batch() {
        let backend = MockBackend::new(&[]);
        let buffer = BufferManager::new(Arc::clone(&backend));

        buffer.add(token(0)).await.unwrap();
        assert!(backend.batches().is_empty());

        tokio::time::advance(Duration::from_millis(1100)).await;
        buffer.add(token(1)).await.unwrap();

        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn batches_preserve_insertion_order() {
        let backend = MockBackend::new(&[]);
        let buffer = BufferManager::with_limits(Arc::clone(&backend), 4, DEFAULT_MAX_AGE);

        for i in 0..8 {
            buffer.add(token(i)).await.unwrap();
        }

        let batches = backend.batches();
        assert_eq!(batches.len(), 2);
        let indices: Vec<u32> = batches.concat().iter().map(|t| t.index).collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn deferred_outcome_is_success() {
        let backend = MockBackend::new(&[Behavior::Defer]);
        let buffer = BufferManager::with_limits(Arc::clone(&backend), 2, DEFAULT_MAX_AGE);

        buffer.add(token(0)).await.unwrap();
        buffer.add(token(1)).await.unwrap();

        assert_eq!(backend.batches().len(), 1);
        assert_eq!(buffer.state().await, BufferState::Idle);
        // Buffer keeps accepting after a deferral.
        buffer.add(token(2)).await.unwrap();
    }

    #[tokio::test]
    async fn fatal_flush_latches_the_buffer() {
        let backend = MockBackend::new(&[Behavior::DiskFull]);
        let buffer = BufferManager::with_limits(Arc::clone(&backend), 2, DEFAULT_MAX_AGE);

        buffer.add(token(0)).await.unwrap();
        let err = buffer.add(token(1)).await.unwrap_err();
        assert!(matches!(err, PersistError::DiskFull(_)));

        assert!(matches!(
            buffer.add(token(2)).await,
            Err(PersistError::Failed(_))
        ));
        assert_eq!(buffer.state().await, BufferState::Flushing);
    }

    #[tokio::test]
    async fn drain_all_flushes_remainder() {
        let backend = MockBackend::new(&[]);
        let buffer = BufferManager::new(Arc::clone(&backend));

        for i in 0..3 {
            buffer.add(token(i)).await.unwrap();
        }
        assert!(backend.batches().is_empty());

        buffer.drain_all().await.unwrap();
        assert_eq!(backend.batches().len(), 1);
        assert_eq!(backend.batches()[0].len(), 3);
        assert!(buffer.last_flush_ms().is_some());
    }

    #[tokio::test]
    async fn drain_all_on_empty_buffer_is_noop() {
        let backend = MockBackend::new(&[]);
        let buffer = BufferManager::new(Arc::clone(&backend));
        buffer.drain_all().await.unwrap();
        assert!(backend.batches().is_empty());
        assert!(buffer.last_flush_ms().is_none());
    }
}
