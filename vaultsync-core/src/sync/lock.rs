//! Cross-process exclusive lock serializing sync operations on one machine.
//!
//! Unix uses an advisory `flock` on the lock file, released by the kernel if
//! the holder dies. Elsewhere the lock is a create-new marker file removed on
//! drop.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Result, VaultSyncError};

/// Guard that holds the lock for its lifetime.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Try to take the lock without blocking. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match imp::try_lock(path)? {
            Some(file) => {
                debug!(path = %path.display(), "Acquired lock");
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    file,
                }))
            }
            None => Ok(None),
        }
    }

    /// Take the sync lock or fail with [`VaultSyncError::AlreadySyncing`].
    pub fn acquire_sync(path: &Path) -> Result<Self> {
        Self::try_acquire(path)?.ok_or(VaultSyncError::AlreadySyncing)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        imp::release(&self.path, &self.file);
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock(path: &Path) -> std::io::Result<Option<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(Some(file));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err)
        }
    }

    pub fn release(_path: &Path, file: &File) {
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub fn try_lock(path: &Path) -> std::io::Result<Option<File>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn release(path: &Path, _file: &File) {
        let _ = fs::remove_file(path);
    }
}
