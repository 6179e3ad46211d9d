//! The `tables.list` manifest.
//!
//! The manifest is the single source of truth for stack membership: a
//! newline-delimited list of table basenames, oldest first. A table file
//! that is not listed is not part of the logical state, no matter what
//! else sits in the directory.
//!
//! The format is plain text on purpose: an operator inspecting a stack
//! directory can read and, in an emergency, repair it with any editor.
//!
//! # Atomic rewrites
//!
//! Every rewrite stages the new body in `tables.list.lock`, which doubles
//! as the writer mutex (see [`crate::lock`]): the staged bytes are
//! fsynced, chmodded, and renamed over `tables.list` in one step. Readers
//! therefore observe either the old or the new manifest, never a torn
//! one, and a successful rename releases the lock implicitly. A failed
//! rename leaves the lock file in place for an operator to inspect.

#[cfg(test)]
mod tests;

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::lock::{LockError, LockFile};

/// Basename of the manifest file.
pub const MANIFEST_FILENAME: &str = "tables.list";

/// Basename of the manifest lock / staging file.
pub const MANIFEST_LOCK_FILENAME: &str = "tables.list.lock";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Lock acquisition or commit failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

// ------------------------------------------------------------------------------------------------
// Paths
// ------------------------------------------------------------------------------------------------

/// Path of `tables.list` inside `dir`.
pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILENAME)
}

/// Path of `tables.list.lock` inside `dir`.
pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_LOCK_FILENAME)
}

// ------------------------------------------------------------------------------------------------
// Read / write
// ------------------------------------------------------------------------------------------------

/// Reads the ordered list of table basenames from `dir`.
///
/// A missing manifest is an empty stack, not an error. A trailing
/// newline (and nothing else) is tolerated and ignored.
pub fn read(dir: &Path) -> Result<Vec<String>, ManifestError> {
    let body = match fs::read_to_string(manifest_path(dir)) {
        Ok(body) => body,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ManifestError::Io(e)),
    };
    Ok(body
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Formats the manifest body for `names`, with a trailing newline.
pub fn format_body(names: &[String]) -> String {
    let mut body = String::new();
    for name in names {
        body.push_str(name);
        body.push('\n');
    }
    body
}

/// Publishes `names` as the new manifest through an already-held lock.
///
/// Writes the body into the lock file, fsyncs, applies `mode` if given,
/// and renames over `tables.list`. Consumes the lock either way: success
/// releases it via the rename, failure leaves it on disk for inspection.
pub(crate) fn commit_with_lock(
    mut lock: LockFile,
    dir: &Path,
    names: &[String],
    mode: Option<u32>,
) -> Result<(), ManifestError> {
    let body = format_body(names);
    lock.write_all(body.as_bytes())?;
    lock.sync()?;
    if let Some(mode) = mode {
        lock.set_mode(mode)?;
    }
    lock.commit(&manifest_path(dir))?;
    fsync_dir(dir)?;
    debug!(tables = names.len(), "manifest rewritten");
    Ok(())
}

/// Makes the rename itself durable.
fn fsync_dir(dir: &Path) -> Result<(), ManifestError> {
    let dir_file = fs::File::open(dir)?;
    dir_file.sync_all()?;
    Ok(())
}
