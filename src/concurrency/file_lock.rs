//! Cross-process advisory file locking (fs2 flock).
//!
//! Used for two things: keeping a single monitoring session per host
//! account, and serializing audit log line writes between the monitor
//! daemon and one-shot CLI commands.

use anyhow::Result;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Advisory lock on a single file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileLock {
    /// Create a lock for `path`, creating parent directories as needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking acquire. Waits until the lock is available.
    pub fn acquire(&self) -> Result<FileLockGuard> {
        let file = self.open()?;
        file.lock_exclusive()?;
        Ok(FileLockGuard { file })
    }

    /// Non-blocking try-acquire. Returns `None` if another holder has it.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLockGuard { file })),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    // Never truncates: the locked path may be the audit log itself.
    fn open(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?)
    }
}
