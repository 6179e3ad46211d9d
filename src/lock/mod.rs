//! Filesystem lock files for inter-process coordination.
//!
//! All writer coordination in a stack directory goes through `.lock`
//! sibling files created with exclusive-create semantics: the process
//! that wins `O_CREAT|O_EXCL` owns the lock, everyone else observes
//! contention immediately. Acquisition never blocks.
//!
//! A [`LockFile`] is scoped: dropping it removes the lock file, so every
//! exit path (success, `?` propagation, panic unwind) releases the lock.
//! The one exception is [`LockFile::commit`], which renames the lock file
//! over its destination; the rename both publishes the staged content and
//! releases the lock in a single atomic step.
//!
//! Stale lock files left behind by a crashed process are never broken by
//! this library. Removing them is an operator decision.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file already exists: another process holds the lock.
    #[error("lock file {path:?} is held by another process")]
    Contended {
        /// Path of the contended lock file.
        path: PathBuf,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// LockFile
// ------------------------------------------------------------------------------------------------

/// An exclusively-created lock file, released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
    /// Set once the lock file has been renamed away (or intentionally
    /// left in place after a failed commit); suppresses removal in drop.
    defused: bool,
}

impl LockFile {
    /// Acquires the lock by exclusively creating `path`.
    ///
    /// Returns [`LockError::Contended`] if the file already exists.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => Ok(Self {
                path,
                file: Some(file),
                defused: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(LockError::Contended { path })
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Path of the lock file itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `data` to the lock file.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), LockError> {
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(data)?;
                Ok(())
            }
            None => Err(LockError::Io(io::Error::other("lock file already closed"))),
        }
    }

    /// Flushes the lock file's content to stable storage.
    pub fn sync(&mut self) -> Result<(), LockError> {
        match self.file.as_mut() {
            Some(file) => {
                file.sync_all()?;
                Ok(())
            }
            None => Err(LockError::Io(io::Error::other("lock file already closed"))),
        }
    }

    /// Sets the permission bits of the lock file.
    #[cfg(unix)]
    pub fn set_mode(&mut self, mode: u32) -> Result<(), LockError> {
        use std::os::unix::fs::PermissionsExt;
        match self.file.as_ref() {
            Some(file) => {
                file.set_permissions(fs::Permissions::from_mode(mode))?;
                Ok(())
            }
            None => Err(LockError::Io(io::Error::other("lock file already closed"))),
        }
    }

    #[cfg(not(unix))]
    pub fn set_mode(&mut self, _mode: u32) -> Result<(), LockError> {
        Ok(())
    }

    /// Publishes the lock file's content by renaming it over `dest`.
    ///
    /// A successful rename releases the lock implicitly. If the rename
    /// fails the lock file is intentionally left in place so an operator
    /// can inspect it; the error is surfaced to the caller.
    pub fn commit(mut self, dest: &Path) -> Result<(), LockError> {
        self.file = None;
        self.defused = true;
        fs::rename(&self.path, dest)?;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        self.file = None;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = ?self.path, %e, "failed to remove lock file");
            }
        }
    }
}
