//! The reference table stack.
//!
//! A [`Stack`] owns one directory of immutable table files plus the
//! `tables.list` manifest that orders them, and presents the union of
//! their contents as a single logical keyspace (see [`crate::merge`]).
//! Writers append tables through the [`Addition`] transaction; a
//! geometric compaction policy (see [`crate::compaction`] and
//! [`Stack::compact_all`]) merges adjacent tables to keep reads cheap.
//!
//! # Concurrency model
//!
//! One stack handle is single-threaded; all concurrency is between
//! *processes* sharing the directory, coordinated through the
//! filesystem:
//!
//! - Writers serialize on the manifest lock (`tables.list.lock`).
//! - Additions are optimistic: a handle whose readers no longer match the
//!   on-disk manifest fails with [`StackError::Outdated`] and must
//!   [`Stack::reload`] before retrying.
//! - Compactors additionally hold a per-table lock for every table in
//!   the merge range.
//! - Readers need no lock at all: each open table keeps its own file
//!   handle, and obsolete files are only unlinked after the manifest
//!   stops referencing them, so an open reader stays valid on POSIX.
//!
//! # Crash recovery
//!
//! A crashed writer can leave behind lock files and table files the
//! manifest never adopted. The library never breaks another holder's
//! lock (that is an operator decision), but [`Stack::clean`] reaps
//! orphaned table files that are unreferenced and unlocked.

mod compaction;

#[cfg(test)]
mod tests;

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction::CompactionStats;
use crate::lock::{LockError, LockFile};
use crate::manifest::{self, ManifestError};
use crate::merge::MergedView;
use crate::record::{HashId, LogRecord, RefRecord};
use crate::table::{self, Table, TableError, TableWriter, WriterOptions};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by stack operations.
#[derive(Debug, Error)]
pub enum StackError {
    /// The in-memory readers no longer match the on-disk manifest;
    /// another process has advanced the stack. Reload and retry.
    #[error("stack is outdated; reload and retry")]
    Outdated,

    /// Lock contention or lock I/O failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Table read, write, or format error.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Manifest read or rewrite error.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Write options
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Stack`] handle.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// POSIX mode bits applied to every table file and manifest the
    /// stack produces, after writing. `None` leaves the umask-derived
    /// creation mode untouched. Lock files always keep their creation
    /// mode.
    pub default_permissions: Option<u32>,

    /// Object-name digest of the stack. Must match the tables already in
    /// the directory; a mismatch fails at open with a format error.
    pub hash_id: HashId,

    /// Suppresses the automatic best-effort compaction that normally
    /// runs after each committed addition.
    pub disable_auto_compact: bool,

    /// Stores log messages byte-for-byte instead of normalizing them to
    /// one trailing newline.
    pub exact_log_message: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            default_permissions: None,
            hash_id: HashId::Sha1,
            disable_auto_compact: false,
            exact_log_message: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Stack
// ------------------------------------------------------------------------------------------------

/// Reloads re-read the manifest this many times when a concurrent
/// compaction unlinks a table between the manifest read and the open.
const MAX_RELOAD_RETRIES: usize = 3;

/// A stack of immutable reference tables backed by one directory.
///
/// Dropping the handle closes all readers; nothing on disk changes.
#[derive(Debug)]
pub struct Stack {
    dir: PathBuf,
    opts: WriteOptions,

    /// Open table readers, one per manifest line, in manifest order
    /// (oldest first).
    readers: Vec<Arc<Table>>,

    /// One past the largest `max_update_index` across all readers; 0 for
    /// an empty stack.
    next_update_index: u64,

    stats: CompactionStats,
}

impl Stack {
    /// Opens the stack rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, opts: WriteOptions) -> Result<Self, StackError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut stack = Self {
            dir,
            opts,
            readers: Vec::new(),
            next_update_index: 0,
            stats: CompactionStats::default(),
        };
        stack.reload()?;

        info!(dir = ?stack.dir, tables = stack.readers.len(), "stack opened");
        Ok(stack)
    }

    /// Directory this stack is rooted at.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write options this handle was opened with.
    pub fn options(&self) -> &WriteOptions {
        &self.opts
    }

    /// Number of tables currently in the stack.
    pub fn tables_len(&self) -> usize {
        self.readers.len()
    }

    /// The update index the next successful addition will write at (or
    /// above).
    pub fn next_update_index(&self) -> u64 {
        self.next_update_index
    }

    /// Compaction telemetry for this handle.
    pub fn compaction_stats(&self) -> &CompactionStats {
        &self.stats
    }

    /// A merged view over the current readers.
    ///
    /// The view holds its own handles, so it stays valid even if the
    /// stack reloads underneath it; it simply keeps showing the state it
    /// was created from.
    pub fn merged(&self) -> MergedView {
        MergedView::new(self.readers.clone())
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    /// Reads the current value of the reference `name`.
    ///
    /// Returns `Ok(None)` when the name is unbound or deleted.
    pub fn read_ref(&self, name: &str) -> Result<Option<RefRecord>, StackError> {
        match self.merged().seek_ref(name)? {
            Some(record) if record.value.is_deletion() => Ok(None),
            other => Ok(other),
        }
    }

    /// Reads the most recent reflog entry for `name`.
    ///
    /// Returns `Ok(None)` when no entry exists or the latest record is a
    /// deletion marker.
    pub fn read_log(&self, name: &str) -> Result<Option<LogRecord>, StackError> {
        match self.merged().seek_log(name)? {
            Some(record) if record.is_deletion() => Ok(None),
            other => Ok(other),
        }
    }

    // --------------------------------------------------------------------
    // Reload
    // --------------------------------------------------------------------

    /// Re-aligns the in-memory readers with the on-disk manifest.
    ///
    /// Readers for basenames present in both the old and new manifest are
    /// carried over untouched (basenames are globally unique, so an equal
    /// name is the same file); readers that dropped out close when their
    /// last handle goes away.
    pub fn reload(&mut self) -> Result<(), StackError> {
        let mut attempt = 0;
        loop {
            let names = manifest::read(&self.dir)?;
            match self.reload_readers(&names) {
                Ok(()) => {
                    self.next_update_index = self
                        .readers
                        .iter()
                        .map(|t| t.max_update_index())
                        .max()
                        .map_or(0, |max| max + 1);
                    debug!(
                        tables = self.readers.len(),
                        next_update_index = self.next_update_index,
                        "stack reloaded"
                    );
                    return Ok(());
                }
                // A concurrent compaction may unlink a table after we read
                // the manifest but before we open the file. The new
                // manifest no longer references it; re-read and retry.
                Err(StackError::Table(TableError::Io(ref e)))
                    if e.kind() == ErrorKind::NotFound && attempt < MAX_RELOAD_RETRIES =>
                {
                    attempt += 1;
                    debug!(attempt, "table vanished during reload; re-reading manifest");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn reload_readers(&mut self, names: &[String]) -> Result<(), StackError> {
        let mut new_readers = Vec::with_capacity(names.len());
        for name in names {
            let existing = self.readers.iter().find(|t| t.name() == name);
            match existing {
                Some(table) => new_readers.push(Arc::clone(table)),
                None => {
                    let table = Table::open(&self.dir.join(name), self.opts.hash_id)?;
                    new_readers.push(Arc::new(table));
                }
            }
        }
        // Still-needed readers were transferred above; replacing the list
        // drops only the removed ones.
        self.readers = new_readers;
        Ok(())
    }

    /// True when `names` matches the readers this handle currently holds.
    fn matches_readers(&self, names: &[String]) -> bool {
        names.len() == self.readers.len()
            && names
                .iter()
                .zip(&self.readers)
                .all(|(name, table)| name == table.name())
    }

    fn reader_names(&self) -> Vec<String> {
        self.readers.iter().map(|t| t.name().to_string()).collect()
    }

    // --------------------------------------------------------------------
    // Additions
    // --------------------------------------------------------------------

    /// Stages and commits one addition in a single call.
    ///
    /// Equivalent to [`Stack::new_addition`] + [`Addition::add`] +
    /// [`Addition::commit`].
    pub fn add<F>(&mut self, write_fn: F) -> Result<(), StackError>
    where
        F: FnOnce(&mut TableWriter) -> Result<(), StackError>,
    {
        let mut addition = self.new_addition()?;
        addition.add(write_fn)?;
        addition.commit()
    }

    /// Begins an addition transaction.
    ///
    /// Acquires the manifest lock and verifies the handle is up to date;
    /// returns [`StackError::Outdated`] (releasing the lock) when another
    /// process has advanced the manifest since the last reload.
    pub fn new_addition(&mut self) -> Result<Addition<'_>, StackError> {
        let lock = LockFile::acquire(manifest::lock_path(&self.dir))?;

        let on_disk = manifest::read(&self.dir)?;
        if !self.matches_readers(&on_disk) {
            debug!("manifest moved since last reload; addition aborted");
            return Err(StackError::Outdated);
        }

        let next_update_index = self.next_update_index;
        Ok(Addition {
            stack: self,
            lock: Some(lock),
            new_tables: Vec::new(),
            next_update_index,
        })
    }

    // --------------------------------------------------------------------
    // Cleanup
    // --------------------------------------------------------------------

    /// Removes table files that are not referenced by the manifest and
    /// not protected by a lock file.
    ///
    /// Runs under the manifest lock, so a concurrent addition can never
    /// be staging the files considered here. Intended to be called once
    /// after open to reclaim debris from crashed writers.
    pub fn clean(&mut self) -> Result<(), StackError> {
        let _lock = LockFile::acquire(manifest::lock_path(&self.dir))?;
        let names = manifest::read(&self.dir)?;

        let mut removed = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if table::parse_table_file_name(file_name).is_none() {
                continue;
            }
            if names.iter().any(|n| n == file_name) {
                continue;
            }
            if self.dir.join(format!("{file_name}.lock")).exists() {
                // Possibly mid-compaction in another process.
                continue;
            }
            fs::remove_file(entry.path())?;
            debug!(table = file_name, "removed orphaned table file");
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "cleaned orphaned table files");
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Addition
// ------------------------------------------------------------------------------------------------

/// An in-progress addition transaction.
///
/// Holds the manifest lock from creation until commit or drop. Each
/// [`Addition::add`] call stages one table; [`Addition::commit`]
/// publishes all staged tables in a single manifest rewrite. Dropping an
/// uncommitted addition deletes the staged tables and releases the lock.
#[derive(Debug)]
pub struct Addition<'a> {
    stack: &'a mut Stack,
    lock: Option<LockFile>,

    /// Final basenames staged so far, in add order.
    new_tables: Vec<String>,

    /// Lower bound for the next staged table's update indices.
    next_update_index: u64,
}

impl Addition<'_> {
    /// Stages one table written through the supplied callback.
    ///
    /// The writer starts with update-index limits
    /// `[next_update_index, next_update_index]`; the callback may widen
    /// them upward with [`TableWriter::set_limits`]. Limits below the
    /// transaction's current floor are an API error: update indices never
    /// decrease, not even between two adds in one transaction.
    ///
    /// A callback that writes no records stages nothing and succeeds.
    pub fn add<F>(&mut self, write_fn: F) -> Result<(), StackError>
    where
        F: FnOnce(&mut TableWriter) -> Result<(), StackError>,
    {
        let staging_path = self
            .stack
            .dir
            .join(format!("stage-{:08x}.tmp", rand::random::<u32>()));
        let mut writer = TableWriter::new(
            &staging_path,
            WriterOptions {
                hash_id: self.stack.opts.hash_id,
                exact_log_message: self.stack.opts.exact_log_message,
            },
            self.next_update_index,
            self.next_update_index,
        );

        // The writer stages in memory; nothing exists on disk until
        // finish(), so error returns here need no file cleanup.
        write_fn(&mut writer)?;

        let finished = match writer.finish()? {
            Some(finished) => finished,
            None => {
                debug!("addition wrote no records; staging skipped");
                return Ok(());
            }
        };

        if finished.min_update_index < self.next_update_index {
            let _ = fs::remove_file(&finished.path);
            return Err(StackError::Table(TableError::Api(format!(
                "table update indices start at {} but the transaction requires at least {}",
                finished.min_update_index, self.next_update_index
            ))));
        }

        let basename = table::table_file_name(
            finished.min_update_index,
            finished.max_update_index,
            rand::random::<u32>(),
        );
        let dest = self.stack.dir.join(&basename);

        let placed = apply_permissions(&finished.path, self.stack.opts.default_permissions)
            .and_then(|()| fs::rename(&finished.path, &dest));
        if let Err(e) = placed {
            let _ = fs::remove_file(&finished.path);
            return Err(e.into());
        }

        debug!(
            table = %basename,
            entries = finished.entry_count,
            "staged addition table"
        );
        self.next_update_index = finished.max_update_index + 1;
        self.new_tables.push(basename);
        Ok(())
    }

    /// Commits the staged tables by rewriting the manifest.
    ///
    /// An addition with nothing staged commits as a no-op: the manifest
    /// is left untouched and the lock is released. Otherwise the new
    /// manifest is published atomically, the stack reloads, and (unless
    /// disabled) a best-effort auto-compaction runs; auto-compaction
    /// failures are recorded in the compaction stats but never affect
    /// the outcome of the commit.
    pub fn commit(mut self) -> Result<(), StackError> {
        if self.new_tables.is_empty() {
            self.lock = None;
            return Ok(());
        }

        let lock = match self.lock.take() {
            Some(lock) => lock,
            None => return Err(StackError::Internal("addition committed twice".into())),
        };

        let mut names = self.stack.reader_names();
        names.extend(self.new_tables.iter().cloned());
        manifest::commit_with_lock(
            lock,
            &self.stack.dir,
            &names,
            self.stack.opts.default_permissions,
        )?;

        info!(tables = self.new_tables.len(), "addition committed");
        self.new_tables.clear();

        self.stack.reload()?;

        if !self.stack.opts.disable_auto_compact {
            if let Err(e) = self.stack.auto_compact() {
                warn!(%e, "auto-compaction after addition failed");
            }
        }
        Ok(())
    }

    /// Update index the next staged table must start at (or above).
    pub fn next_update_index(&self) -> u64 {
        self.next_update_index
    }
}

impl Drop for Addition<'_> {
    fn drop(&mut self) {
        // Reached with staged tables only when the transaction was
        // abandoned or failed; the manifest never adopted them.
        for name in &self.new_tables {
            let path = self.stack.dir.join(name);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(table = %name, %e, "failed to remove staged table");
                }
            }
        }
        // `self.lock` drops here, releasing `tables.list.lock`.
    }
}

// ------------------------------------------------------------------------------------------------
// Permissions
// ------------------------------------------------------------------------------------------------

/// Applies `mode` to `path` when configured; a `None` mode keeps the
/// umask-derived creation permissions.
#[cfg(unix)]
pub(crate) fn apply_permissions(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn apply_permissions(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}
