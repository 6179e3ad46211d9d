//! Compaction planning and telemetry.
//!
//! A stack accumulates one table per addition; without merging, read
//! amplification grows linearly in the number of writes. The planner in
//! this module keeps the table count logarithmic by maintaining a
//! geometric size sequence: walking from the newest table backwards,
//! every table should be at least `factor` times larger than everything
//! newer than it combined. Where that property breaks, the planner
//! proposes the widest contiguous segment whose merge restores it.
//!
//! Sizes are measured in record counts, which additions produce in O(1)
//! from table footers.
//!
//! The executor itself lives with the stack (it needs the lock protocol
//! and the manifest); this module holds the pure pieces: the planner,
//! the [`CompactionStats`] counters, and the [`LogExpiry`] policy.


use std::ops::Range;

/// Geometric factor used when the caller passes 0.
pub const DEFAULT_GEOMETRIC_FACTOR: u8 = 2;

// ------------------------------------------------------------------------------------------------
// CompactionStats
// ------------------------------------------------------------------------------------------------

/// Counters describing compaction activity on one stack handle.
///
/// Auto-compaction runs after every addition and is allowed to fail
/// without failing the addition; these counters are the only place such
/// failures become observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Number of compaction attempts, explicit and automatic.
    pub attempts: u64,

    /// Number of attempts that ended in an error.
    pub failures: u64,

    /// Total records written into replacement tables.
    pub entries_written: u64,
}

// ------------------------------------------------------------------------------------------------
// LogExpiry
// ------------------------------------------------------------------------------------------------

/// Reflog expiry policy applied while compacting.
///
/// Log entries strictly below either bound are dropped from the merged
/// output. A zero bound is inactive.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExpiry {
    /// Drop live log entries with `time` strictly below this wall-clock
    /// lower bound (seconds since the UNIX epoch).
    pub time: u64,

    /// Drop log records with `update_index` strictly below this bound.
    pub min_update_index: u64,
}

// ------------------------------------------------------------------------------------------------
// Planner
// ------------------------------------------------------------------------------------------------

/// Proposes a half-open range of adjacent tables to merge, or `None`
/// when the sequence is already geometric.
///
/// `sizes` lists record counts in stack order, oldest first. The oldest
/// table (index 0) can never be the *end* of a segment: there is nothing
/// older to fold it into.
///
/// The segment end is the newest boundary violation: the highest `i`
/// whose predecessor is not at least `factor` times larger than
/// `sizes[i]`. From there the segment grows backwards, absorbing every
/// predecessor that fails to dominate the accumulated merge size by
/// `factor`. Growing backwards as far as possible merges the most tables
/// per rewrite, so repeated small merges of the same young tables are
/// avoided.
pub fn suggest_compaction_segment(sizes: &[u64], factor: u8) -> Option<Range<usize>> {
    let factor = u64::from(if factor == 0 {
        DEFAULT_GEOMETRIC_FACTOR
    } else {
        factor
    });

    // Zero or one table is geometric by definition.
    if sizes.len() <= 1 {
        return None;
    }

    let mut end = 0usize;
    let mut bytes = 0u64;
    for i in (1..sizes.len()).rev() {
        if sizes[i - 1] < sizes[i].saturating_mul(factor) {
            end = i + 1;
            bytes = sizes[i];
            break;
        }
    }
    if end == 0 {
        return None;
    }

    let mut start = end - 1;
    for i in (1..end).rev() {
        let merged = bytes;
        if sizes[i - 1] < merged.saturating_mul(factor) {
            start = i - 1;
            bytes = bytes.saturating_add(sizes[i - 1]);
        }
    }

    Some(start..end)
}
