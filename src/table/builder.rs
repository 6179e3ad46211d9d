//! Table writer — stages sorted records and builds a complete table file.
//!
//! A [`TableWriter`] is handed to the caller of an addition (or driven by
//! the compaction executor). It buffers records in memory, enforcing the
//! table contract as they arrive:
//!
//! - ref records strictly ascending by name, one per name;
//! - log records in `(name ASC, update_index DESC)` order, one per
//!   `(name, update_index)`;
//! - every update index inside the declared `[min, max]` limits;
//! - object id widths matching the stack's hash id;
//! - log messages normalized to one trailing newline (unless the writer
//!   was opened with `exact_log_message`), with interior newlines
//!   rejected.
//!
//! Violations are [`TableError::Api`] and leave no file behind.
//!
//! Nothing touches the filesystem until [`TableWriter::finish`], which
//! writes header, checksummed blocks, bloom filter, and footer in one
//! pass, fsyncs, and reports the finished file. A writer that received no
//! records finishes as `Ok(None)`: the empty table never exists on disk.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;

use crate::encoding::Encode;
use crate::record::{HashId, LogRecord, RefRecord, RefValue};

use super::{
    BLOOM_FALSE_POSITIVE_RATE, BlockHandle, Footer, TableError, encode_footer, encode_header,
};

// ------------------------------------------------------------------------------------------------
// Writer options
// ------------------------------------------------------------------------------------------------

/// Per-writer configuration, derived from the stack's write options.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Object-name digest stamped into the header and used to validate
    /// object id widths.
    pub hash_id: HashId,

    /// Disables log-message newline normalization.
    pub exact_log_message: bool,
}

// ------------------------------------------------------------------------------------------------
// FinishedTable
// ------------------------------------------------------------------------------------------------

/// Description of a table file produced by [`TableWriter::finish`].
#[derive(Debug)]
pub struct FinishedTable {
    /// Path the table was written to (a staging name; the stack renames
    /// it to its final basename).
    pub path: PathBuf,

    /// Smallest update index the writer accepted.
    pub min_update_index: u64,

    /// Largest update index the writer accepted.
    pub max_update_index: u64,

    /// Total number of records written.
    pub entry_count: u64,
}

// ------------------------------------------------------------------------------------------------
// TableWriter
// ------------------------------------------------------------------------------------------------

/// Stages sorted ref and log records and writes them as one table file.
#[derive(Debug)]
pub struct TableWriter {
    path: PathBuf,
    opts: WriterOptions,

    min_update_index: u64,
    max_update_index: u64,

    ref_buf: Vec<u8>,
    ref_count: u64,
    last_ref_name: Option<String>,
    ref_names: Vec<Vec<u8>>,

    log_buf: Vec<u8>,
    log_count: u64,
    last_log_key: Option<(String, u64)>,
}

impl TableWriter {
    /// Creates a writer that will materialize at `path` on finish.
    ///
    /// `min`/`max` are the initial update-index limits; the caller may
    /// widen them with [`TableWriter::set_limits`] before adding records.
    pub fn new(path: impl Into<PathBuf>, opts: WriterOptions, min: u64, max: u64) -> Self {
        Self {
            path: path.into(),
            opts,
            min_update_index: min,
            max_update_index: max,
            ref_buf: Vec::new(),
            ref_count: 0,
            last_ref_name: None,
            ref_names: Vec::new(),
            log_buf: Vec::new(),
            log_count: 0,
            last_log_key: None,
        }
    }

    /// Declares the `[min, max]` update-index interval of this table.
    ///
    /// Must be called before any record is added; the interval is stamped
    /// into the footer and every record is validated against it.
    pub fn set_limits(&mut self, min: u64, max: u64) -> Result<(), TableError> {
        if self.ref_count > 0 || self.log_count > 0 {
            return Err(TableError::Api(
                "update-index limits must be set before records are added".into(),
            ));
        }
        if min > max {
            return Err(TableError::Api(format!(
                "invalid update-index limits [{min}, {max}]"
            )));
        }
        self.min_update_index = min;
        self.max_update_index = max;
        Ok(())
    }

    /// Lower update-index limit currently in effect.
    pub fn min_update_index(&self) -> u64 {
        self.min_update_index
    }

    /// Upper update-index limit currently in effect.
    pub fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    /// Appends one ref record.
    ///
    /// Records must arrive in strictly ascending name order.
    pub fn add_ref(&mut self, record: &RefRecord) -> Result<(), TableError> {
        self.check_update_index(record.update_index)?;
        self.check_ref_value(&record.value)?;

        if let Some(last) = &self.last_ref_name {
            if record.name.as_str() <= last.as_str() {
                return Err(TableError::Api(format!(
                    "ref {:?} not in strictly ascending name order (last was {last:?})",
                    record.name
                )));
            }
        }

        record.encode_to(&mut self.ref_buf)?;
        self.ref_names.push(record.name.clone().into_bytes());
        self.last_ref_name = Some(record.name.clone());
        self.ref_count += 1;
        Ok(())
    }

    /// Appends one log record.
    ///
    /// Records must arrive in `(name ASC, update_index DESC)` order. The
    /// message of a live entry is normalized per the writer options.
    pub fn add_log(&mut self, record: &LogRecord) -> Result<(), TableError> {
        self.check_update_index(record.update_index)?;

        let record = match &record.update {
            Some(update) => {
                self.check_object_id(&update.old_id)?;
                self.check_object_id(&update.new_id)?;
                let message = self.normalize_message(&update.message)?;
                let mut normalized = record.clone();
                if let Some(u) = normalized.update.as_mut() {
                    u.message = message;
                }
                normalized
            }
            None => record.clone(),
        };

        let key = (record.name.clone(), record.update_index);
        if let Some((last_name, last_index)) = &self.last_log_key {
            let in_order = match record.name.as_str().cmp(last_name.as_str()) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => record.update_index < *last_index,
                std::cmp::Ordering::Less => false,
            };
            if !in_order {
                return Err(TableError::Api(format!(
                    "log {:?}@{} out of order (last was {:?}@{})",
                    record.name, record.update_index, last_name, last_index
                )));
            }
        }

        record.encode_to(&mut self.log_buf)?;
        self.last_log_key = Some(key);
        self.log_count += 1;
        Ok(())
    }

    /// Writes the staged records as a complete table file.
    ///
    /// Returns `Ok(None)` without touching the filesystem when no records
    /// were added.
    pub fn finish(self) -> Result<Option<FinishedTable>, TableError> {
        if self.ref_count == 0 && self.log_count == 0 {
            return Ok(None);
        }

        let mut buf = encode_header(self.opts.hash_id);

        let refs = append_block(&mut buf, &self.ref_buf)?;
        let logs = append_block(&mut buf, &self.log_buf)?;

        let bloom_payload = if self.ref_names.is_empty() {
            Vec::new()
        } else {
            let mut bloom =
                Bloom::new_for_fp_rate(self.ref_names.len(), BLOOM_FALSE_POSITIVE_RATE)
                    .map_err(|e| TableError::Internal(format!("bloom construction: {e}")))?;
            for name in &self.ref_names {
                bloom.set(name);
            }
            bloom.as_slice().to_vec()
        };
        let bloom = append_block(&mut buf, &bloom_payload)?;

        let footer = Footer {
            refs,
            logs,
            bloom,
            ref_count: self.ref_count,
            log_count: self.log_count,
            min_update_index: self.min_update_index,
            max_update_index: self.max_update_index,
        };
        buf.extend_from_slice(&encode_footer(&footer)?);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;

        Ok(Some(FinishedTable {
            path: self.path,
            min_update_index: self.min_update_index,
            max_update_index: self.max_update_index,
            entry_count: self.ref_count + self.log_count,
        }))
    }

    // --------------------------------------------------------------------
    // Validation helpers
    // --------------------------------------------------------------------

    fn check_update_index(&self, index: u64) -> Result<(), TableError> {
        if index < self.min_update_index || index > self.max_update_index {
            return Err(TableError::Api(format!(
                "update index {index} outside limits [{}, {}]",
                self.min_update_index, self.max_update_index
            )));
        }
        Ok(())
    }

    fn check_ref_value(&self, value: &RefValue) -> Result<(), TableError> {
        match value {
            RefValue::Deletion | RefValue::Symbolic(_) => Ok(()),
            RefValue::Direct(id) => self.check_object_id(id),
            RefValue::DirectPeeled { id, peeled } => {
                self.check_object_id(id)?;
                self.check_object_id(peeled)
            }
        }
    }

    fn check_object_id(&self, id: &[u8]) -> Result<(), TableError> {
        let want = self.opts.hash_id.object_len();
        if id.len() != want {
            return Err(TableError::Api(format!(
                "object id is {} bytes, expected {want}",
                id.len()
            )));
        }
        Ok(())
    }

    /// Applies the log-message newline contract.
    ///
    /// Messages carry exactly one trailing newline; an empty message
    /// becomes `"\n"`. A newline anywhere before the last byte is
    /// rejected. With `exact_log_message` the message passes through
    /// untouched.
    fn normalize_message(&self, message: &str) -> Result<String, TableError> {
        if self.opts.exact_log_message {
            return Ok(message.to_string());
        }
        let body = message.strip_suffix('\n').unwrap_or(message);
        if body.contains('\n') {
            return Err(TableError::Api(
                "log message contains an embedded newline".into(),
            ));
        }
        if message.ends_with('\n') {
            Ok(message.to_string())
        } else {
            Ok(format!("{message}\n"))
        }
    }
}

/// Appends one checksummed block to `buf`, returning its handle.
fn append_block(buf: &mut Vec<u8>, payload: &[u8]) -> Result<BlockHandle, TableError> {
    let offset = buf.len() as u64;
    let len = u32::try_from(payload.len())
        .map_err(|_| TableError::Internal("block payload exceeds u32::MAX".into()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);

    let mut hasher = Crc32::new();
    hasher.update(payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(BlockHandle {
        offset,
        len: payload.len() as u64,
    })
}
