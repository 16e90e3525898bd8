//! Named advisory file locks for cross-process mutual exclusion.
//!
//! Renewal runs must be serialized across every control-plane instance on
//! a host (deployment rollovers run two side by side), so the lock lives
//! in the filesystem rather than in process memory. `flock(2)` gives the
//! release-on-close guarantee: a crashed holder never leaves the lock
//! stuck.
//!
//! # Synchronization Protocol
//!
//! The lock file uses `flock(LOCK_EX)` for mutual exclusion. Acquisition
//! establishes the happens-before edge with the previous holder's release;
//! dropping the [`LockGuard`] closes the descriptor and releases the lock.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{WardenError, WardenResult};

/// Interval between acquisition attempts while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound of the random jitter added to each poll interval
const POLL_JITTER_MS: u64 = 100;

/// A named advisory lock backed by a file.
///
/// Cloneable handle; every clone locks the same underlying file, and locks
/// taken through separate handles (or separate processes) exclude each
/// other.
#[derive(Debug, Clone)]
pub struct NamedLock {
    name: String,
    path: PathBuf,
}

impl NamedLock {
    /// Create a lock handle for the given lock file path.
    ///
    /// The file (and its parent directory) is created on first acquisition.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// The lock's name, used in logs and contention errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to acquire the lock without waiting.
    ///
    /// Returns `Ok(Some(guard))` on success, `Ok(None)` when another holder
    /// currently owns the lock.
    ///
    /// # Errors
    ///
    /// Returns an IO error for filesystem failures other than contention.
    pub fn try_acquire(&self) -> WardenResult<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| WardenError::io_at(parent.display().to_string(), e))?;
            }
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| WardenError::io_at(self.path.display().to_string(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(&self.path, perms) {
                warn!(path = %self.path.display(), error = %e, "Failed to set lock file permissions");
            }
        }

        match try_flock_exclusive(&lock_file) {
            Ok(true) => {
                debug!(lock = %self.name, "Lock acquired");
                Ok(Some(LockGuard {
                    _lock_file: lock_file,
                    name: self.name.clone(),
                }))
            }
            Ok(false) => Ok(None),
            Err(e) => Err(WardenError::io_at(self.path.display().to_string(), e)),
        }
    }

    /// Acquire the lock, polling with jitter until success or timeout.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::LockContended`] when the lock is still held
    /// after `timeout`; callers treat that as a skip signal, not a failure.
    pub async fn acquire(&self, timeout: Duration) -> WardenResult<LockGuard> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(WardenError::LockContended {
                    name: self.name.clone(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let jitter_ms = rand::random::<u64>() % (POLL_JITTER_MS + 1);
            tokio::time::sleep(POLL_INTERVAL + Duration::from_millis(jitter_ms)).await;
        }
    }
}

/// RAII guard for an exclusively-held named lock.
///
/// The lock is released when this guard is dropped. The underlying file
/// lock is released by the OS when the file descriptor is closed.
pub struct LockGuard {
    /// The lock file (held open for the lifetime of the guard).
    _lock_file: File,
    /// Lock name for diagnostics.
    name: String,
}

impl LockGuard {
    /// Name of the lock this guard holds
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if the file is
/// already locked elsewhere.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: flock is a standard POSIX call. fd is a valid descriptor
        // owned by `file`. LOCK_EX | LOCK_NB is a non-blocking exclusive lock.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = NamedLock::new("renewal", dir.path().join("renewal.lock"));

        let guard = lock.try_acquire().unwrap().expect("first acquire");
        assert!(lock.try_acquire().unwrap().is_none(), "held lock must exclude");

        drop(guard);
        assert!(lock.try_acquire().unwrap().is_some(), "released lock must be free");
    }

    #[tokio::test]
    async fn test_acquire_times_out_as_contention() {
        let dir = tempfile::tempdir().unwrap();
        let lock = NamedLock::new("renewal", dir.path().join("renewal.lock"));

        let _guard = lock.try_acquire().unwrap().expect("first acquire");
        let err = lock
            .acquire(Duration::from_millis(50))
            .await
            .expect_err("second acquire must time out");
        assert!(err.is_lock_contention());
    }

    #[tokio::test]
    async fn test_acquire_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = NamedLock::new("renewal", dir.path().join("renewal.lock"));

        {
            let _guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
        }
        let _second = lock.acquire(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("locks").join("nested").join("renewal.lock");
        let lock = NamedLock::new("renewal", &nested);

        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_separate_handles_share_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renewal.lock");
        let a = NamedLock::new("renewal", &path);
        let b = NamedLock::new("renewal", &path);

        let _guard = a.try_acquire().unwrap().expect("first acquire");
        assert!(b.try_acquire().unwrap().is_none());
    }
}
