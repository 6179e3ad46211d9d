//! # refstack
//!
//! An embeddable, transactional **stack of immutable reference tables**:
//! persistent storage for a version-control system's refs (branches,
//! tags, symbolic refs) and their reflog history, backed by a directory
//! on a POSIX-like filesystem. Designed for safe multi-process writers
//! and crash recovery without a server.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Stack                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌───────────────┐  │
//! │  │ tables.list │  │   Readers   │  │  MergedView   │  │
//! │  │ (manifest)  │──│ (one/table) │──│ (union scan)  │  │
//! │  └──────┬──────┘  └─────────────┘  └───────────────┘  │
//! │         │ atomic rename under tables.list.lock         │
//! │  ┌──────┴──────────────────────────────────────────┐  │
//! │  │  Addition (staged tables)  │  Compaction (merge)│  │
//! │  └─────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`stack`] | Stack handle — open, read, additions, compaction, cleanup |
//! | [`table`] | Immutable on-disk tables: writer, mmap reader, iterators |
//! | [`merge`] | K-way merged view over many tables, newest wins |
//! | [`manifest`] | The `tables.list` membership file and its atomic rewrite |
//! | [`lock`] | Exclusive-create lock files, scoped release |
//! | [`compaction`] | Geometric compaction planner, stats, log expiry |
//! | [`record`] | Ref and log record types, hash ids |
//! | [`encoding`] | Crate-owned deterministic wire format |
//!
//! ## Key properties
//!
//! - **Atomic commits** — a stack's membership changes only by renaming a
//!   staged `tables.list` over the old one; readers see the old or the
//!   new list, never a torn one.
//! - **Optimistic multi-process writes** — writers serialize on a lock
//!   file; a writer working from a stale view fails with
//!   [`StackError::Outdated`](stack::StackError::Outdated), reloads, and
//!   retries.
//! - **Monotonic update indices** — every write is tagged; each table
//!   covers one contiguous index interval, and intervals ascend through
//!   the stack.
//! - **Geometric compaction** — table count stays logarithmic in the
//!   number of writes; the automatic pass after each addition is
//!   best-effort and never fails a write.
//! - **Crash recovery** — unfinished additions and compactions leave only
//!   unreferenced files, reaped by [`Stack::clean`](stack::Stack::clean);
//!   stale locks are left for the operator.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use refstack::record::RefRecord;
//! use refstack::stack::{Stack, WriteOptions};
//!
//! let mut stack = Stack::open("/tmp/refs", WriteOptions::default())?;
//!
//! let index = stack.next_update_index();
//! stack.add(|writer| {
//!     writer.add_ref(&RefRecord::symbolic("HEAD", index, "refs/heads/main"))?;
//!     Ok(())
//! })?;
//!
//! let head = stack.read_ref("HEAD")?;
//! assert!(head.is_some());
//! # Ok::<(), refstack::stack::StackError>(())
//! ```

pub mod compaction;
pub mod encoding;
pub mod lock;
pub mod manifest;
pub mod merge;
pub mod record;
pub mod stack;
pub mod table;

pub use compaction::{CompactionStats, LogExpiry};
pub use record::{HashId, LogRecord, LogUpdate, RefRecord, RefValue};
pub use stack::{Addition, Stack, StackError, WriteOptions};
pub use table::{Table, TableError, TableWriter};
