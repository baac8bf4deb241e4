// src/lock.rs

//! Daemon exclusive lock
//!
//! Mutating operations assume exactly one activation worker on the whole
//! system; the lock file makes that assumption hold across processes. The
//! lock is held for the lifetime of the owning handle and released on drop.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// System-wide exclusive lock held while activation operations run
pub struct ApexdLock {
    // Kept open to maintain the flock.
    _file: File,
    path: PathBuf,
}

impl ApexdLock {
    /// Acquire the lock, blocking until it is available.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open_lock_file(&path)?;
        file.lock_exclusive()
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!(
                "failed to acquire lock {}: {}", path.display(), e
            ))))?;
        info!("acquired daemon lock at {}", path.display());
        Ok(Self { _file: file, path })
    }

    /// Try to acquire the lock without blocking. Returns `Ok(None)` when
    /// another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("acquired daemon lock at {}", path.display());
                Ok(Some(Self { _file: file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("daemon lock already held at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(path)?)
    }

    /// Record the holder's pid next to the lock file.
    pub fn write_pid(&self) -> Result<()> {
        fs::write(self.pid_path(), std::process::id().to_string())?;
        Ok(())
    }

    fn pid_path(&self) -> PathBuf {
        self.path.with_extension("pid")
    }
}

impl Drop for ApexdLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.pid_path());
        // The flock itself is released when the file closes.
        debug!("released daemon lock at {}", self.path.display());
    }
}
