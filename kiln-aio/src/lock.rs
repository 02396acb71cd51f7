// kiln-aio/src/lock.rs
//
// Advisory per-key locks backed by `flock`. A lock is held for as long as the
// `PathLock` value lives; dropping it (or the process exiting) releases it.
// Two handles opened by the same process also exclude each other.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use kiln_common::error::{KilnError, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct PathLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

impl PathLock {
    /// Blocks the current thread until the lock is available.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;
        file.lock_exclusive().map_err(|e| {
            KilnError::Lock(format!("Failed to lock {}: {e}", path.display()))
        })?;
        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    /// Returns `Ok(None)` if another holder has the lock.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired lock {}", path.display());
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_contended(&e) => Ok(None),
            Err(e) => Err(KilnError::Lock(format!(
                "Failed to try-lock {}: {e}",
                path.display()
            ))),
        }
    }

    /// Waits for the lock without blocking the runtime. Gives up with
    /// `KilnError::Cancelled` when `cancel` fires.
    pub async fn acquire_async(path: impl AsRef<Path>, cancel: &CancellationToken) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut announced = false;
        loop {
            if let Some(lock) = Self::try_acquire(&path)? {
                return Ok(lock);
            }
            if !announced {
                debug!("Waiting for lock {}", path.display());
                announced = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(KilnError::Cancelled),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("guise.lock");

        let first = PathLock::acquire(&path).unwrap();
        assert!(PathLock::try_acquire(&path).unwrap().is_none());
        drop(first);
        assert!(PathLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn async_acquire_waits_and_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.lock");
        let held = PathLock::acquire(&path).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            PathLock::acquire_async(&path, &token).await,
            Err(KilnError::Cancelled)
        ));

        let token = CancellationToken::new();
        let waiter = {
            let path = path.clone();
            let token = token.clone();
            tokio::spawn(async move { PathLock::acquire_async(&path, &token).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
