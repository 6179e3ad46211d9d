//! Compaction executor.
//!
//! Merges a contiguous range of tables into at most one replacement
//! table, under the full lock protocol:
//!
//! 1. Acquire the manifest lock and verify the handle is up to date.
//! 2. Acquire a per-table lock for every table in the range. Explicit
//!    compaction treats any contention as failure; auto-compaction
//!    narrows the range to the largest contiguous lockable run instead
//!    (prefix preferred on ties) and succeeds as a no-op when no run of
//!    at least two tables is available.
//! 3. Stream the merged view through a fresh writer, applying the
//!    tombstone and log-expiry policies.
//! 4. Splice the manifest (range replaced by zero or one basename) and
//!    publish it through the held lock.
//! 5. Unlink the replaced tables, release the table locks, reload.
//!
//! The manifest lock is held across the whole merge, so additions and
//! other compactions observe contention rather than torn state.

use std::fs;

use tracing::{debug, info, warn};

use crate::compaction::{DEFAULT_GEOMETRIC_FACTOR, LogExpiry, suggest_compaction_segment};
use crate::lock::{LockError, LockFile};
use crate::manifest;
use crate::merge::MergedView;
use crate::table::{self, TableWriter, WriterOptions};

use super::{Stack, StackError, apply_permissions};

/// Lock-failure policy for one compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockSemantics {
    /// Any table-lock contention fails the whole compaction.
    Strict,

    /// Table-lock contention narrows the range; never a failure.
    BestEffort,
}

impl Stack {
    /// Merges the entire stack into a single table.
    ///
    /// Surfaces [`StackError::Lock`] if any table in the stack is locked
    /// by another process. An empty stack compacts trivially.
    pub fn compact_all(&mut self, expiry: Option<LogExpiry>) -> Result<(), StackError> {
        if self.readers.is_empty() {
            return Ok(());
        }
        let last = self.readers.len() - 1;
        self.compact_range(0, last, expiry, LockSemantics::Strict)
    }

    /// Runs one round of geometric auto-compaction.
    ///
    /// Asks the planner for a segment over the current entry counts and
    /// merges it with best-effort lock semantics. Lock contention never
    /// fails this operation; it narrows the merge or skips it entirely.
    pub fn auto_compact(&mut self) -> Result<(), StackError> {
        let sizes: Vec<u64> = self.readers.iter().map(|t| t.entry_count()).collect();
        let Some(segment) = suggest_compaction_segment(&sizes, DEFAULT_GEOMETRIC_FACTOR) else {
            return Ok(());
        };
        if segment.len() < 2 {
            return Ok(());
        }
        self.compact_range(segment.start, segment.end - 1, None, LockSemantics::BestEffort)
    }

    /// Stats-keeping wrapper around the executor.
    fn compact_range(
        &mut self,
        first: usize,
        last: usize,
        expiry: Option<LogExpiry>,
        semantics: LockSemantics,
    ) -> Result<(), StackError> {
        self.stats.attempts += 1;
        match self.compact_range_inner(first, last, expiry, semantics) {
            Ok(written) => {
                self.stats.entries_written += written;
                Ok(())
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(e)
            }
        }
    }

    fn compact_range_inner(
        &mut self,
        mut first: usize,
        mut last: usize,
        expiry: Option<LogExpiry>,
        semantics: LockSemantics,
    ) -> Result<u64, StackError> {
        if first > last || last >= self.readers.len() {
            return Err(StackError::Internal(format!(
                "compaction range [{first}, {last}] out of bounds for {} tables",
                self.readers.len()
            )));
        }

        let manifest_lock = LockFile::acquire(manifest::lock_path(&self.dir))?;
        let on_disk = manifest::read(&self.dir)?;
        if !self.matches_readers(&on_disk) {
            debug!("manifest moved since last reload; compaction aborted");
            return Err(StackError::Outdated);
        }

        // Lock every table in the range. `slots` stays parallel to
        // `first..=last` so best-effort narrowing can reason about runs.
        let mut slots: Vec<Option<LockFile>> = Vec::with_capacity(last - first + 1);
        for i in first..=last {
            let path = self.dir.join(format!("{}.lock", self.readers[i].name()));
            match LockFile::acquire(path) {
                Ok(lock) => slots.push(Some(lock)),
                Err(LockError::Contended { path }) => match semantics {
                    LockSemantics::Strict => {
                        debug!(lock = ?path, "table locked by another process");
                        return Err(StackError::Lock(LockError::Contended { path }));
                    }
                    LockSemantics::BestEffort => slots.push(None),
                },
                Err(e) => return Err(e.into()),
            }
        }

        if semantics == LockSemantics::BestEffort {
            let (run_start, run_len) = longest_locked_run(&slots);
            if run_len < 2 {
                debug!("no lockable sub-range of two or more tables; skipping");
                return Ok(0);
            }
            if run_len < slots.len() {
                debug!(
                    skipped = slots.len() - run_len,
                    "narrowed compaction to a lockable sub-range"
                );
            }
            // Locks outside the chosen run release here.
            slots.drain(run_start + run_len..);
            let kept: Vec<Option<LockFile>> = slots.drain(run_start..).collect();
            slots = kept;
            last = first + run_start + slots.len() - 1;
            first += run_start;
        }

        let subset = self.readers[first..=last].to_vec();
        let merged = MergedView::new(subset.clone());
        let includes_oldest = first == 0;

        let staging_path = self
            .dir
            .join(format!("compact-{:08x}.tmp", rand::random::<u32>()));
        let mut writer = TableWriter::new(
            &staging_path,
            WriterOptions {
                hash_id: self.opts.hash_id,
                exact_log_message: self.opts.exact_log_message,
            },
            subset[0].min_update_index(),
            subset[subset.len() - 1].max_update_index(),
        );

        let mut written = 0u64;
        for record in merged.iter_refs() {
            let record = record?;
            // With nothing older in the merge's shadow, tombstones have
            // done their job and can be dropped.
            if record.value.is_deletion() && includes_oldest {
                continue;
            }
            writer.add_ref(&record)?;
            written += 1;
        }
        for record in merged.iter_logs() {
            let record = record?;
            if record.is_deletion() && includes_oldest {
                continue;
            }
            if let Some(expiry) = expiry {
                if record.update_index < expiry.min_update_index {
                    continue;
                }
                if let Some(update) = &record.update {
                    if update.time < expiry.time {
                        continue;
                    }
                }
            }
            writer.add_log(&record)?;
            written += 1;
        }

        // Splice the manifest: [0, first) ++ replacement? ++ (last, N).
        let mut names: Vec<String> = on_disk[..first].to_vec();
        let mut replacement = None;
        if let Some(finished) = writer.finish()? {
            let basename = table::table_file_name(
                finished.min_update_index,
                finished.max_update_index,
                rand::random::<u32>(),
            );
            let dest = self.dir.join(&basename);
            let placed = apply_permissions(&finished.path, self.opts.default_permissions)
                .and_then(|()| fs::rename(&finished.path, &dest));
            if let Err(e) = placed {
                let _ = fs::remove_file(&finished.path);
                return Err(e.into());
            }
            names.push(basename.clone());
            replacement = Some(basename);
        }
        names.extend(on_disk[last + 1..].iter().cloned());

        if let Err(e) =
            manifest::commit_with_lock(manifest_lock, &self.dir, &names, self.opts.default_permissions)
        {
            if let Some(basename) = &replacement {
                let _ = fs::remove_file(self.dir.join(basename));
            }
            return Err(e.into());
        }

        // The manifest no longer references the merged tables; unlink
        // them while still holding their locks. Failures leave debris
        // that clean() reaps later.
        for name in &on_disk[first..=last] {
            if let Err(e) = fs::remove_file(self.dir.join(name)) {
                warn!(table = %name, %e, "failed to remove obsolete table file");
            }
        }

        drop(slots);
        self.reload()?;

        info!(
            first,
            last,
            merged = last - first + 1,
            produced = replacement.is_some(),
            entries = written,
            "compacted tables"
        );
        Ok(written)
    }
}

/// Finds the longest contiguous run of acquired locks, returning
/// `(start, len)`. Earlier runs win ties.
fn longest_locked_run(slots: &[Option<LockFile>]) -> (usize, usize) {
    let mut best = (0, 0);
    let mut run_start = 0;
    let mut run_len = 0;
    for (i, slot) in slots.iter().enumerate() {
        if slot.is_some() {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len > best.1 {
                best = (run_start, run_len);
            }
        } else {
            run_len = 0;
        }
    }
    best
}
