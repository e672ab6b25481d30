//! Advisory file locks guarding server startup and teardown.
//!
//! `flock(2)` on a lock file next to the socket. The lock is held for the
//! lifetime of [`AdvisoryLock`] and released when it is dropped, on every exit
//! path. Lock files are left in place; deleting them would race with the next
//! process opening the same path.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to open lock file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to lock {}: {source}", .path.display())]
    Lock { path: PathBuf, source: Errno },

    #[error("lock task failed: {0}")]
    Join(String),
}

/// An exclusive advisory lock, released on drop.
pub struct AdvisoryLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl AdvisoryLock {
    /// Block the current thread until the lock is held.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref();
        Self::lock(path, FlockArg::LockExclusive)
    }

    /// Take the lock if nobody holds it; `Ok(None)` if it is held elsewhere.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>, LockError> {
        match Self::lock(path.as_ref(), FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(lock)),
            Err(LockError::Lock { source, .. }) if source == Errno::EWOULDBLOCK => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// [`acquire`](Self::acquire) on the blocking pool.
    pub async fn acquire_async(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        tokio::task::spawn_blocking(move || Self::acquire(&path))
            .await
            .map_err(|e| LockError::Join(e.to_string()))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(path: &Path, arg: FlockArg) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let flock = Flock::lock(file, arg).map_err(|(_, source)| LockError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::trace!(path = %path.display(), "Lock acquired");
        Ok(Self {
            _flock: flock,
            path: path.to_path_buf(),
        })
    }
}

impl std::fmt::Debug for AdvisoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLock").field("path", &self.path).finish()
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        tracing::trace!(path = %self.path.display(), "Lock released");
    }
}
