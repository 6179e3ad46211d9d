//! Immutable reference table files.
//!
//! A table is an append-only artifact produced by one addition or one
//! compaction. It holds sorted ref and log records covering a single
//! `[min_update_index, max_update_index]` interval, stamped in the footer.
//! Once written and renamed into place a table is never modified; the
//! stack retires it by dropping it from the manifest and unlinking it.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER: magic "RTBL" | version u32 | hash_id u32 | crc32]
//! [REF BLOCK:   len_le | encoded RefRecords, name ASC        | crc32_le]
//! [LOG BLOCK:   len_le | encoded LogRecords, (name, idx DESC)| crc32_le]
//! [BLOOM BLOCK: len_le | serialized ref-name bloom filter    | crc32_le]
//! [FOOTER: block handles | ref_count | log_count |
//!          min_update_index | max_update_index | magic | crc32]
//! ```
//!
//! - **Header** identifies the format and the object-name digest; a table
//!   written under one [`HashId`] cannot be opened under another.
//! - **Ref block** holds the reference bindings, strictly ascending by
//!   name (one record per name per table).
//! - **Log block** holds reflog entries ordered by `(name ASC,
//!   update_index DESC)` so the most recent entry for a name comes first.
//! - **Bloom block** holds a filter over the ref names, letting negative
//!   point lookups skip the table without touching the ref block.
//! - **Footer** is fixed-size and checksummed; its presence proves the
//!   table was written to completion.
//!
//! # Concurrency model
//!
//! Tables are immutable, so readers are lock-free. A [`Table`] owns its
//! open file handle and memory map; on POSIX an open file survives
//! unlink, so a reader stays valid even after compaction retires the
//! file behind its back.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableWriter`] for staging and writing tables.
//! - [`iterator`] — [`RefIter`] / [`LogIter`] borrowed block cursors.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{FinishedTable, TableWriter, WriterOptions};
pub use iterator::{LogIter, RefIter};

use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::Path;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::record::{HashId, LogRecord, RefRecord};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const TABLE_MAGIC: [u8; 4] = *b"RTBL";
pub(crate) const TABLE_VERSION: u32 = 1;
pub(crate) const TABLE_SUFFIX: &str = ".ref";

pub(crate) const HEADER_SIZE: usize = 16;
pub(crate) const FOOTER_SIZE: usize = 88;
pub(crate) const BLOCK_LEN_SIZE: usize = 4;
pub(crate) const BLOCK_CRC_SIZE: usize = 4;

pub(crate) const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table operations (open, read, build).
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file does not start with the table magic.
    #[error("not a reference table (bad magic)")]
    BadMagic,

    /// The table was written by an unsupported format version.
    #[error("unsupported table format version {0}")]
    UnsupportedVersion(u32),

    /// The table was written under a different object-name digest.
    #[error("hash id mismatch (expected {expected:#010x}, found {found:#010x})")]
    HashIdMismatch {
        /// Format id the stack was opened with.
        expected: u32,
        /// Format id found in the table header.
        found: u32,
    },

    /// A block or footer checksum did not match its content.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The file is too short to hold a complete table.
    #[error("table file truncated")]
    Truncated,

    /// Caller misuse of the writer API: out-of-order records, update
    /// indices outside the declared limits, malformed log messages.
    #[error("api misuse: {0}")]
    Api(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Offset and payload length of one checksummed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    /// File offset of the block's length prefix.
    pub(crate) offset: u64,

    /// Payload length in bytes (excludes length prefix and checksum).
    pub(crate) len: u64,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.len.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (off, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (len, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { offset: off, len }, offset))
    }
}

/// Decoded table footer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    /// Handle of the ref block.
    pub(crate) refs: BlockHandle,

    /// Handle of the log block.
    pub(crate) logs: BlockHandle,

    /// Handle of the bloom filter block.
    pub(crate) bloom: BlockHandle,

    /// Number of ref records in the table.
    pub(crate) ref_count: u64,

    /// Number of log records in the table.
    pub(crate) log_count: u64,

    /// Smallest update index covered by this table.
    pub(crate) min_update_index: u64,

    /// Largest update index covered by this table.
    pub(crate) max_update_index: u64,
}

// ------------------------------------------------------------------------------------------------
// Header / footer serialization
// ------------------------------------------------------------------------------------------------

/// Encodes the 16-byte table header for the given hash id.
pub(crate) fn encode_header(hash_id: HashId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&TABLE_MAGIC);
    buf.extend_from_slice(&TABLE_VERSION.to_le_bytes());
    buf.extend_from_slice(&hash_id.format_id().to_le_bytes());

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Validates the header at the start of `data` against `expected`.
fn validate_header(data: &[u8], expected: HashId) -> Result<(), TableError> {
    if data.len() < HEADER_SIZE {
        return Err(TableError::Truncated);
    }
    if data[..4] != TABLE_MAGIC {
        return Err(TableError::BadMagic);
    }

    let (version, _) = u32::decode_from(&data[4..8])?;
    if version != TABLE_VERSION {
        return Err(TableError::UnsupportedVersion(version));
    }

    let mut hasher = Crc32::new();
    hasher.update(&data[..12]);
    let (stored_crc, _) = u32::decode_from(&data[12..16])?;
    if hasher.finalize() != stored_crc {
        return Err(TableError::ChecksumMismatch);
    }

    let (found, _) = u32::decode_from(&data[8..12])?;
    if found != expected.format_id() {
        return Err(TableError::HashIdMismatch {
            expected: expected.format_id(),
            found,
        });
    }
    Ok(())
}

/// Encodes the fixed-size footer, including its trailing magic and CRC.
pub(crate) fn encode_footer(footer: &Footer) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::with_capacity(FOOTER_SIZE);
    footer.refs.encode_to(&mut buf)?;
    footer.logs.encode_to(&mut buf)?;
    footer.bloom.encode_to(&mut buf)?;
    footer.ref_count.encode_to(&mut buf)?;
    footer.log_count.encode_to(&mut buf)?;
    footer.min_update_index.encode_to(&mut buf)?;
    footer.max_update_index.encode_to(&mut buf)?;
    buf.extend_from_slice(&TABLE_MAGIC);

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decodes and validates the footer from the last [`FOOTER_SIZE`] bytes.
fn decode_footer(data: &[u8]) -> Result<Footer, TableError> {
    if data.len() != FOOTER_SIZE {
        return Err(TableError::Truncated);
    }

    let mut hasher = Crc32::new();
    hasher.update(&data[..FOOTER_SIZE - 4]);
    let (stored_crc, _) = u32::decode_from(&data[FOOTER_SIZE - 4..])?;
    if hasher.finalize() != stored_crc {
        return Err(TableError::ChecksumMismatch);
    }

    if data[FOOTER_SIZE - 8..FOOTER_SIZE - 4] != TABLE_MAGIC {
        return Err(TableError::BadMagic);
    }

    let mut offset = 0;
    let (refs, n) = BlockHandle::decode_from(&data[offset..])?;
    offset += n;
    let (logs, n) = BlockHandle::decode_from(&data[offset..])?;
    offset += n;
    let (bloom, n) = BlockHandle::decode_from(&data[offset..])?;
    offset += n;
    let (ref_count, n) = u64::decode_from(&data[offset..])?;
    offset += n;
    let (log_count, n) = u64::decode_from(&data[offset..])?;
    offset += n;
    let (min_update_index, n) = u64::decode_from(&data[offset..])?;
    offset += n;
    let (max_update_index, _) = u64::decode_from(&data[offset..])?;

    Ok(Footer {
        refs,
        logs,
        bloom,
        ref_count,
        log_count,
        min_update_index,
        max_update_index,
    })
}

// ------------------------------------------------------------------------------------------------
// Table file names
// ------------------------------------------------------------------------------------------------

/// Formats the basename of a table covering `[min, max]`.
///
/// The random suffix makes basenames globally unique, which is what lets
/// reload diff manifests by name alone.
pub(crate) fn table_file_name(min: u64, max: u64, suffix: u32) -> String {
    format!("{min:016x}-{max:016x}-{suffix:08x}{TABLE_SUFFIX}")
}

/// Parses a table basename, returning its `(min, max)` interval.
///
/// Returns `None` for anything that does not match the exact basename
/// shape; cleanup uses this as its "is this ours to reap" test.
pub(crate) fn parse_table_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(TABLE_SUFFIX)?;
    let bytes = stem.as_bytes();
    // <16 hex>-<16 hex>-<8 hex>
    if bytes.len() != 42 || bytes[16] != b'-' || bytes[33] != b'-' {
        return None;
    }
    if !stem
        .chars()
        .enumerate()
        .all(|(i, c)| i == 16 || i == 33 || c.is_ascii_hexdigit())
    {
        return None;
    }
    let min = u64::from_str_radix(&stem[..16], 16).ok()?;
    let max = u64::from_str_radix(&stem[17..33], 16).ok()?;
    Some((min, max))
}

// ------------------------------------------------------------------------------------------------
// Table reader
// ------------------------------------------------------------------------------------------------

/// An open, validated, memory-mapped table file.
#[derive(Debug)]
pub struct Table {
    name: String,
    // The handle is retained so the mapping stays valid after the file is
    // unlinked by a concurrent compaction.
    _file: File,
    mmap: Mmap,
    footer: Footer,
    refs_range: Range<usize>,
    logs_range: Range<usize>,
    bloom_range: Range<usize>,
}

impl Table {
    /// Opens and fully validates a table file.
    ///
    /// Header magic/version/hash-id, footer, and every block checksum are
    /// verified up front, so iteration and lookups never observe torn
    /// on-disk state.
    pub fn open(path: &Path, expected_hash: HashId) -> Result<Self, TableError> {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => {
                return Err(TableError::Internal(format!(
                    "table path {path:?} has no basename"
                )));
            }
        };

        let file = File::open(path)?;
        // SAFETY: the table file is immutable by protocol; it is never
        // written in place after the rename that published it.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(TableError::Truncated);
        }
        validate_header(&mmap, expected_hash)?;
        let footer = decode_footer(&mmap[mmap.len() - FOOTER_SIZE..])?;

        let refs_range = checked_block(&mmap, footer.refs)?;
        let logs_range = checked_block(&mmap, footer.logs)?;
        let bloom_range = checked_block(&mmap, footer.bloom)?;

        Ok(Self {
            name,
            _file: file,
            mmap,
            footer,
            refs_range,
            logs_range,
            bloom_range,
        })
    }

    /// Basename of the table file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Smallest update index covered by this table.
    pub fn min_update_index(&self) -> u64 {
        self.footer.min_update_index
    }

    /// Largest update index covered by this table.
    pub fn max_update_index(&self) -> u64 {
        self.footer.max_update_index
    }

    /// Number of ref records.
    pub fn ref_count(&self) -> u64 {
        self.footer.ref_count
    }

    /// Number of log records.
    pub fn log_count(&self) -> u64 {
        self.footer.log_count
    }

    /// Total number of records; the compaction planner's size measure.
    pub fn entry_count(&self) -> u64 {
        self.footer.ref_count + self.footer.log_count
    }

    /// Iterates all ref records in name order.
    pub fn iter_refs(&self) -> RefIter<'_> {
        RefIter::new(&self.mmap[self.refs_range.clone()], self.footer.ref_count)
    }

    /// Iterates all log records in `(name ASC, update_index DESC)` order.
    pub fn iter_logs(&self) -> LogIter<'_> {
        LogIter::new(&self.mmap[self.logs_range.clone()], self.footer.log_count)
    }

    /// Checks the ref-name bloom filter.
    ///
    /// Returns `true` if the filter says "maybe present" or the table
    /// has no filter; `false` only when the name is definitively absent.
    pub fn bloom_may_contain(&self, name: &[u8]) -> bool {
        let data = &self.mmap[self.bloom_range.clone()];
        if data.is_empty() {
            return true;
        }
        match Bloom::from_slice(data) {
            Ok(bloom) => bloom.check(name),
            // A corrupted filter cannot exclude anything.
            Err(_) => true,
        }
    }

    /// Point lookup of a ref record, including tombstones.
    ///
    /// The bloom filter short-circuits names this table cannot contain.
    pub fn seek_ref(&self, name: &str) -> Result<Option<RefRecord>, TableError> {
        if !self.bloom_may_contain(name.as_bytes()) {
            return Ok(None);
        }
        for record in self.iter_refs() {
            let record = record?;
            match record.name.as_str().cmp(name) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Point lookup of the most recent log record for `name`, including
    /// deletion markers.
    pub fn seek_log(&self, name: &str) -> Result<Option<LogRecord>, TableError> {
        for record in self.iter_logs() {
            let record = record?;
            match record.name.as_str().cmp(name) {
                std::cmp::Ordering::Less => continue,
                // Records for one name are index-descending, so the first
                // hit is the most recent entry.
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }
}

/// Validates one checksummed block and returns its payload range.
fn checked_block(data: &[u8], handle: BlockHandle) -> Result<Range<usize>, TableError> {
    let offset = usize::try_from(handle.offset)
        .map_err(|_| TableError::Internal("block offset exceeds address space".into()))?;
    let payload_len = usize::try_from(handle.len)
        .map_err(|_| TableError::Internal("block length exceeds address space".into()))?;

    let payload_start = offset
        .checked_add(BLOCK_LEN_SIZE)
        .ok_or(TableError::Truncated)?;
    let payload_end = payload_start
        .checked_add(payload_len)
        .ok_or(TableError::Truncated)?;
    let block_end = payload_end
        .checked_add(BLOCK_CRC_SIZE)
        .ok_or(TableError::Truncated)?;
    if block_end > data.len() {
        return Err(TableError::Truncated);
    }

    let (stored_len, _) = u32::decode_from(&data[offset..payload_start])?;
    if stored_len as usize != payload_len {
        return Err(TableError::ChecksumMismatch);
    }

    let mut hasher = Crc32::new();
    hasher.update(&data[payload_start..payload_end]);
    let (stored_crc, _) = u32::decode_from(&data[payload_end..block_end])?;
    if hasher.finalize() != stored_crc {
        return Err(TableError::ChecksumMismatch);
    }

    Ok(payload_start..payload_end)
}
