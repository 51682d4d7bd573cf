//! Single-instance locking for whole-invocation operations.
//!
//! An [`InstanceLock`] hands out advisory, host-local `flock` guards keyed by
//! operation name. Acquisition never blocks: if another invocation holds the
//! lock the guarded body is skipped. The lock is released when the
//! [`LockGuard`] drops, which also happens when the body panics or a future
//! holding the guard is cancelled.
//!
//! # Example
//!
//! ```rust,ignore
//! use timmy::lock::InstanceLock;
//!
//! let lock = InstanceLock::new(std::env::temp_dir(), "timmy");
//! match lock.with_lock("collect", |_guard| collect_logs())? {
//!     Some(report) => println!("{report}"),
//!     None => println!("another collection is already running"),
//! }
//! ```

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::LockError;

/// Default tool name used in lock file names.
pub const DEFAULT_TOOL_NAME: &str = "timmy";

/// Factory for per-operation lock guards sharing one lock directory.
#[derive(Debug, Clone)]
pub struct InstanceLock {
    lock_dir: PathBuf,
    tool_name: String,
}

impl InstanceLock {
    /// Creates a lock factory storing files in `lock_dir`.
    pub fn new(lock_dir: impl Into<PathBuf>, tool_name: impl Into<String>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Lock factory in the system temp directory with the default tool name.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir(), DEFAULT_TOOL_NAME)
    }

    /// Path of the lock file for `operation`.
    pub fn lock_path(&self, operation: &str) -> PathBuf {
        self.lock_dir
            .join(format!("{}_{}.lock", self.tool_name, operation))
    }

    /// Tries to take the lock for `operation` without blocking.
    ///
    /// Returns `Ok(None)` when another holder has it.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the name is unusable or the lock file cannot
    /// be opened or locked for a reason other than contention.
    pub fn try_acquire(&self, operation: &str) -> Result<Option<LockGuard>, LockError> {
        validate_operation(operation)?;
        let path = self.lock_path(operation);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        match try_flock_exclusive(&file) {
            Ok(true) => {
                debug!(operation, path = %path.display(), "Lock acquired");
                Ok(Some(LockGuard {
                    file,
                    path,
                    operation: operation.to_string(),
                }))
            }
            Ok(false) => Ok(None),
            Err(source) => Err(LockError::Flock { path, source }),
        }
    }

    /// Runs `body` while holding the lock for `operation`.
    ///
    /// Returns `Ok(None)` without running `body` if the lock is held
    /// elsewhere.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the lock file cannot be used at all.
    pub fn with_lock<T>(
        &self,
        operation: &str,
        body: impl FnOnce(&LockGuard) -> T,
    ) -> Result<Option<T>, LockError> {
        let Some(guard) = self.try_acquire(operation)? else {
            warn!("Unable to obtain lock, skipping \"{}\"", operation);
            return Ok(None);
        };
        Ok(Some(body(&guard)))
    }

    /// Async counterpart of [`InstanceLock::with_lock`].
    ///
    /// The guard moves into the body's future and is released when that
    /// future completes or is dropped.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the lock file cannot be used at all.
    pub async fn with_lock_async<T, F, Fut>(
        &self,
        operation: &str,
        body: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce(LockGuard) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(guard) = self.try_acquire(operation)? else {
            warn!("Unable to obtain lock, skipping \"{}\"", operation);
            return Ok(None);
        };
        Ok(Some(body(guard).await))
    }
}

impl Default for InstanceLock {
    fn default() -> Self {
        Self::in_temp_dir()
    }
}

/// Proof of holding an operation's lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    operation: String,
}

impl LockGuard {
    /// The operation this guard locks.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // SAFETY: the fd is owned by `self.file` and still open.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "Failed to unlock, closing the file releases it"
            );
        }
        debug!(operation = %self.operation, "Lock released");
    }
}

fn validate_operation(operation: &str) -> Result<(), LockError> {
    let valid = !operation.is_empty()
        && operation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && operation != "."
        && operation != "..";
    if valid {
        Ok(())
    } else {
        Err(LockError::InvalidName(operation.to_string()))
    }
}

/// Non-blocking exclusive `flock`. `Ok(false)` means another holder.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: flock is a plain POSIX call on a descriptor owned by `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}
