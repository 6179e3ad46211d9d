//! Merged view over an ordered list of tables.
//!
//! A [`MergedView`] fans N tables (oldest first, same order as the
//! manifest) into one logical keyspace per record kind:
//!
//! - **Refs** merge by name; where several tables hold the same name, the
//!   newest table's record shadows the rest. Tombstones take part in the
//!   merge like any other record, so a deletion in a new table hides a
//!   live binding in an older one.
//! - **Logs** merge by `(name ASC, update_index DESC)`; duplicate keys
//!   resolve to the newest table's record.
//!
//! Point lookups probe tables newest-to-oldest and stop at the first hit,
//! which is sound because a newer table's record always shadows older
//! ones for the same key. Full scans use a heap-based k-way merge.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::record::{LogRecord, RefRecord};
use crate::table::{LogIter, RefIter, Table, TableError};

// ------------------------------------------------------------------------------------------------
// MergedView
// ------------------------------------------------------------------------------------------------

/// Union view over a list of tables, oldest first.
#[derive(Debug, Clone)]
pub struct MergedView {
    tables: Vec<Arc<Table>>,
}

impl MergedView {
    /// Creates a view over `tables`, which must be in stack order
    /// (oldest first).
    pub fn new(tables: Vec<Arc<Table>>) -> Self {
        Self { tables }
    }

    /// Number of tables in the view.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns `true` when the view contains no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Looks up the winning ref record for `name`, tombstones included.
    pub fn seek_ref(&self, name: &str) -> Result<Option<RefRecord>, TableError> {
        for table in self.tables.iter().rev() {
            if let Some(record) = table.seek_ref(name)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Looks up the most recent log record for `name`, deletion markers
    /// included.
    ///
    /// Update-index intervals ascend through the stack, so the newest
    /// table containing any entry for `name` also holds its latest one.
    pub fn seek_log(&self, name: &str) -> Result<Option<LogRecord>, TableError> {
        for table in self.tables.iter().rev() {
            if let Some(record) = table.seek_log(name)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Iterates the merged ref keyspace in name order, one winning record
    /// per name.
    pub fn iter_refs(&self) -> MergedRefIter<'_> {
        MergedRefIter::new(self.tables.iter().map(|t| t.iter_refs()).collect())
    }

    /// Iterates the merged log keyspace in `(name ASC, update_index
    /// DESC)` order, one winning record per key.
    pub fn iter_logs(&self) -> MergedLogIter<'_> {
        MergedLogIter::new(self.tables.iter().map(|t| t.iter_logs()).collect())
    }
}

// ------------------------------------------------------------------------------------------------
// Merged ref iterator
// ------------------------------------------------------------------------------------------------

struct RefHeapEntry {
    record: RefRecord,
    source: usize,
}

impl Ord for RefHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on name; among equal names the higher source index
        // (newer table) pops first and shadows the rest.
        other
            .record
            .name
            .cmp(&self.record.name)
            .then(self.source.cmp(&other.source))
    }
}

impl PartialOrd for RefHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RefHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record.name == other.record.name && self.source == other.source
    }
}

impl Eq for RefHeapEntry {}

/// Heap-based k-way merge over ref records with newest-wins shadowing.
pub struct MergedRefIter<'a> {
    sources: Vec<RefIter<'a>>,
    heap: BinaryHeap<RefHeapEntry>,
    initialized: bool,
    failed: bool,
}

impl<'a> MergedRefIter<'a> {
    fn new(sources: Vec<RefIter<'a>>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            initialized: false,
            failed: false,
        }
    }

    fn refill(&mut self, source: usize) -> Result<(), TableError> {
        match self.sources[source].next() {
            Some(Ok(record)) => {
                self.heap.push(RefHeapEntry { record, source });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_initialized(&mut self) -> Result<(), TableError> {
        if !self.initialized {
            self.initialized = true;
            for source in 0..self.sources.len() {
                self.refill(source)?;
            }
        }
        Ok(())
    }
}

impl Iterator for MergedRefIter<'_> {
    type Item = Result<RefRecord, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.ensure_initialized() {
            self.failed = true;
            return Some(Err(e));
        }

        let entry = self.heap.pop()?;
        if let Err(e) = self.refill(entry.source) {
            self.failed = true;
            return Some(Err(e));
        }

        // Pop and discard shadowed records for the same name.
        while let Some(top) = self.heap.peek() {
            if top.record.name != entry.record.name {
                break;
            }
            let shadowed = self.heap.pop()?;
            if let Err(e) = self.refill(shadowed.source) {
                self.failed = true;
                return Some(Err(e));
            }
        }

        Some(Ok(entry.record))
    }
}

// ------------------------------------------------------------------------------------------------
// Merged log iterator
// ------------------------------------------------------------------------------------------------

struct LogHeapEntry {
    record: LogRecord,
    source: usize,
}

impl LogHeapEntry {
    fn key(&self) -> (&str, u64) {
        (self.record.name.as_str(), self.record.update_index)
    }
}

impl Ord for LogHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on name, then max on update index, then newer table
        // first among exact key duplicates.
        other
            .record
            .name
            .cmp(&self.record.name)
            .then(self.record.update_index.cmp(&other.record.update_index))
            .then(self.source.cmp(&other.source))
    }
}

impl PartialOrd for LogHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LogHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.source == other.source
    }
}

impl Eq for LogHeapEntry {}

/// Heap-based k-way merge over log records with newest-wins shadowing of
/// exact `(name, update_index)` duplicates.
pub struct MergedLogIter<'a> {
    sources: Vec<LogIter<'a>>,
    heap: BinaryHeap<LogHeapEntry>,
    initialized: bool,
    failed: bool,
}

impl<'a> MergedLogIter<'a> {
    fn new(sources: Vec<LogIter<'a>>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            initialized: false,
            failed: false,
        }
    }

    fn refill(&mut self, source: usize) -> Result<(), TableError> {
        match self.sources[source].next() {
            Some(Ok(record)) => {
                self.heap.push(LogHeapEntry { record, source });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_initialized(&mut self) -> Result<(), TableError> {
        if !self.initialized {
            self.initialized = true;
            for source in 0..self.sources.len() {
                self.refill(source)?;
            }
        }
        Ok(())
    }
}

impl Iterator for MergedLogIter<'_> {
    type Item = Result<LogRecord, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.ensure_initialized() {
            self.failed = true;
            return Some(Err(e));
        }

        let entry = self.heap.pop()?;
        if let Err(e) = self.refill(entry.source) {
            self.failed = true;
            return Some(Err(e));
        }

        while let Some(top) = self.heap.peek() {
            if top.key() != entry.key() {
                break;
            }
            let shadowed = self.heap.pop()?;
            if let Err(e) = self.refill(shadowed.source) {
                self.failed = true;
                return Some(Err(e));
            }
        }

        Some(Ok(entry.record))
    }
}
