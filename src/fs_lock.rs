//! Cross-process advisory file lock with exponential backoff.
//!
//! Every component that needs mutual exclusion across processes (task
//! store claims, mailbox append/poll, the merge lock) goes through this
//! module instead of re-implementing its own retry loop.

use crate::constants::{LOCK_BACKOFF_INITIAL_MS, LOCK_BACKOFF_MAX_MS};
use crate::{RalphError, Result};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// A held exclusive lock. Releasing happens on drop, on every exit path,
/// matching spec.md 4.1's "scoped acquisition with guaranteed release".
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                tracing::warn!("failed to unlock {:?}: {}", self.path, e);
            }
        }
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).write(true).open(path)
}

/// Attempts to acquire an exclusive lock on `path`, retrying with
/// exponential backoff (50ms -> 500ms, capped) until `timeout` elapses.
/// Returns `Ok(None)` on timeout rather than failing.
pub async fn try_acquire(path: &Path, timeout: Duration) -> Result<Option<LockGuard>> {
    let path = path.to_path_buf();
    let deadline = Instant::now() + timeout;
    let mut backoff_ms = LOCK_BACKOFF_INITIAL_MS;

    loop {
        let path_clone = path.clone();
        let attempt = tokio::task::spawn_blocking(move || -> std::io::Result<Option<File>> {
            let file = open_lock_file(&path_clone)?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(file)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| RalphError::Internal(anyhow::anyhow!("lock task join error: {e}")))??;

        if let Some(file) = attempt {
            return Ok(Some(LockGuard {
                file: Some(file),
                path,
            }));
        }

        if Instant::now() >= deadline {
            return Ok(None);
        }

        debug!(?path, backoff_ms, "lock contended, backing off");
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(LOCK_BACKOFF_MAX_MS);
    }
}

/// Same as [`try_acquire`] but fails with [`RalphError::LockTimeout`]
/// instead of returning `None`.
pub async fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard> {
    try_acquire(path, timeout)
        .await?
        .ok_or_else(|| RalphError::LockTimeout {
            path: path.display().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquires_uncontended_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let guard = acquire(&path, Duration::from_millis(500)).await.unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_first_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let _guard = acquire(&path, Duration::from_millis(500)).await.unwrap();

        let result = try_acquire(&path, Duration::from_millis(150)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        {
            let _guard = acquire(&path, Duration::from_millis(500)).await.unwrap();
        }
        let guard = acquire(&path, Duration::from_millis(500)).await;
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn acquire_fails_with_lock_timeout_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let _guard = acquire(&path, Duration::from_millis(500)).await.unwrap();

        let result = acquire(&path, Duration::from_millis(150)).await;
        assert!(matches!(result, Err(RalphError::LockTimeout { .. })));
    }
}
