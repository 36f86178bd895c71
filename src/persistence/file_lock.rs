//! Advisory exclusive file locks
//!
//! Cross-process mutual exclusion built on `flock(2)`. The lock is tied to the
//! open file description, so it is released when the guard is dropped or the
//! owning process dies.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held exclusive lock on a lock file
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock is acquired
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;
        sys::lock(&file)?;
        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another holder owns it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;
        if sys::try_lock(&file)? {
            debug!("Acquired lock {}", path.display());
            Ok(Some(Self { file, path }))
        } else {
            debug!("Lock {} is held elsewhere", path.display());
            Ok(None)
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(unix)]
mod sys {
    use crate::error::Result;
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    pub fn lock(file: &File) -> Result<()> {
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn try_lock(file: &File) -> Result<bool> {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(true),
            Err(Errno::EWOULDBLOCK) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn unlock(file: &File) -> Result<()> {
        flock(file.as_raw_fd(), FlockArg::Unlock)?;
        Ok(())
    }
}

// Without flock the lock degrades to process-local exclusion provided by the
// callers' in-process guards.
#[cfg(not(unix))]
mod sys {
    use crate::error::Result;
    use std::fs::File;

    pub fn lock(_file: &File) -> Result<()> {
        Ok(())
    }

    pub fn try_lock(_file: &File) -> Result<bool> {
        Ok(true)
    }

    pub fn unlock(_file: &File) -> Result<()> {
        Ok(())
    }
}
