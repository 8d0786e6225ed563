//! Advisory, exclusive, non-reentrant file locks built on `flock(2)`.
//!
//! A lock is bound to a path and held by one open file description. It is released
//! when the guard is dropped (or explicitly via [`FileLock::release`]) and by the
//! kernel when the owning process exits, so a crashed holder never leaves it held.
//! Unlike a pid file, the lock file itself is left in place on release.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Held exclusive lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another holder owns it. Opening the same path twice
    /// inside one process yields two independent descriptions, so two tasks in one
    /// process contend exactly like two processes do.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<FileLock>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        // SAFETY: flock on a valid, owned descriptor.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            tracing::debug!("[FileLock] Acquired {}", path.display());
            return Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            }));
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            tracing::debug!("[FileLock] {} is held elsewhere", path.display());
            Ok(None)
        } else {
            Err(err)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!("[FileLock] Released {}", self.path.display());
    }
}

