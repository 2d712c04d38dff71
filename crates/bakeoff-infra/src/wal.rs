//! Append-only write-ahead log for token batches.
//!
//! One JSON record per line (see `bakeoff_types::wal`). A successful `append`
//! implies durability: the data is flushed and fsynced before returning.
//! Writes are serialised under one async mutex; the file rotates to
//! `wal-YYYYMMDDHHMM.bak` once it reaches the size threshold. `truncate` is
//! only called after `read_lines` has been fully drained into the database.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;

use bakeoff_types::error::WalError;
use bakeoff_types::token::Token;
use bakeoff_types::wal::WalRecord;

pub struct WalLog {
    path: PathBuf,
    max_size_bytes: u64,
    /// Serialises append/rotate/truncate against each other.
    lock: Mutex<()>,
}

impl WalLog {
    /// Open (or create the directory for) a WAL at `path`.
    pub async fn new(path: impl Into<PathBuf>, max_size_bytes: u64) -> Result<Self, WalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&path, e))?;
        }
        Ok(Self {
            path,
            max_size_bytes,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append every token of the batch as one line each, then fsync.
    pub async fn append(&self, batch: &[Token]) -> Result<(), WalError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        self.rotate_if_needed_locked().await?;

        let mut lines = String::new();
        for token in batch {
            lines.push_str(&WalRecord::from_token(token).to_line()?);
            lines.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.flush().await.map_err(|e| io_error(&self.path, e))?;
        file.sync_data().await.map_err(|e| io_error(&self.path, e))?;

        tracing::debug!(count = batch.len(), path = %self.path.display(), "wal append");
        Ok(())
    }

    /// Restartable line reader over the current file, `None` when no WAL
    /// exists yet.
    pub async fn read_lines(&self) -> Result<Option<Lines<BufReader<File>>>, WalError> {
        match File::open(&self.path).await {
            Ok(file) => Ok(Some(BufReader::new(file).lines())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    /// Remove all content. Only called after a fully successful replay.
    pub async fn truncate(&self) -> Result<(), WalError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "wal truncated after replay");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    /// Rotate the file out to a timestamped `.bak` when it has reached the
    /// size threshold. Returns the backup path when a rotation happened.
    pub async fn rotate_if_needed(&self) -> Result<Option<PathBuf>, WalError> {
        let _guard = self.lock.lock().await;
        self.rotate_if_needed_locked().await
    }

    async fn rotate_if_needed_locked(&self) -> Result<Option<PathBuf>, WalError> {
        let size = self.size_bytes().await;
        if size < self.max_size_bytes {
            return Ok(None);
        }

        let stamp = chrono::Utc::now().format("%Y%m%d%H%M");
        let backup = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("wal-{stamp}.bak"));
        tokio::fs::rename(&self.path, &backup)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        tracing::info!(size, backup = %backup.display(), "wal rotated");
        Ok(Some(backup))
    }

    /// Current file size in bytes (0 when missing).
    pub async fn size_bytes(&self) -> u64 {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

fn io_error(path: &Path, e: std::io::Error) -> WalError {
    // ENOSPC gets its own class: it is the "both media failed" trigger.
    if e.raw_os_error() == Some(28) || e.kind() == std::io::ErrorKind::StorageFull {
        WalError::DiskFull(format!("{}: {e}", path.display()))
    } else {
        WalError::Io(format!("{}: {e}", path.display()))
    }
}
