//! Integration tests for the public `Stack` API.
//!
//! These tests exercise the full stack (tables → manifest → merge →
//! compaction) through the public `refstack::{Stack, WriteOptions, …}`
//! surface only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, drop-based close, reopen on existing state
//! - **Writes**: additions, tombstones, reflog entries, no-op probes
//! - **Reads**: point lookups, newest-wins shadowing, merged scans
//! - **Multi-handle**: optimistic concurrency, reload-and-retry
//! - **Compaction**: explicit merge, auto-compaction, log expiry, stats
//! - **Recovery**: clean() after simulated crash debris
//!
//! ## See also
//! - `stack::tests` — internal stack-level unit tests
//! - `table::tests` — table read/write unit tests
//! - `merge::tests` — merged-view unit tests

use refstack::record::{LogRecord, LogUpdate, RefRecord, RefValue};
use refstack::stack::{Stack, StackError, WriteOptions};
use refstack::{LogExpiry, TableError};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn oid(byte: u8) -> Vec<u8> {
    vec![byte; 20]
}

fn manual() -> WriteOptions {
    WriteOptions {
        disable_auto_compact: true,
        ..WriteOptions::default()
    }
}

fn put_ref(stack: &mut Stack, name: &str, byte: u8) {
    let index = stack.next_update_index();
    let record = RefRecord::direct(name, index, oid(byte));
    stack
        .add(move |writer| {
            writer.add_ref(&record)?;
            Ok(())
        })
        .expect("put_ref");
}

fn put_log(stack: &mut Stack, name: &str, time: u64, message: &str) {
    let index = stack.next_update_index();
    let record = LogRecord {
        name: name.to_string(),
        update_index: index,
        update: Some(LogUpdate {
            old_id: oid(0),
            new_id: oid(1),
            committer: "ada".to_string(),
            email: "ada@example.com".to_string(),
            time,
            tz_offset: 60,
            message: message.to_string(),
        }),
    };
    stack
        .add(move |writer| {
            writer.add_log(&record)?;
            Ok(())
        })
        .expect("put_log");
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Open a fresh stack, write nothing, drop it. The directory holds at
/// most the (absent) manifest.
#[test]
fn open_drop_empty() {
    let dir = TempDir::new().unwrap();
    {
        let stack = Stack::open(dir.path(), WriteOptions::default()).unwrap();
        assert_eq!(stack.tables_len(), 0);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// # Scenario
/// State written through one handle is fully visible after reopening
/// the directory with a fresh handle.
#[test]
fn reopen_preserves_state() {
    let dir = TempDir::new().unwrap();
    {
        let mut stack = Stack::open(dir.path(), WriteOptions::default()).unwrap();
        put_ref(&mut stack, "refs/heads/main", 0x11);
        put_log(&mut stack, "refs/heads/main", 1000, "created\n");
    }

    let stack = Stack::open(dir.path(), WriteOptions::default()).unwrap();
    let head = stack.read_ref("refs/heads/main").unwrap().unwrap();
    assert_eq!(head.value, RefValue::Direct(oid(0x11)));

    let log = stack.read_log("refs/heads/main").unwrap().unwrap();
    assert_eq!(log.update.unwrap().message, "created\n");
}

// ================================================================================================
// Writes and reads
// ================================================================================================

/// # Scenario
/// The latest addition wins: overwriting a ref, then deleting it, is
/// observed in order.
#[test]
fn overwrite_then_delete() {
    let dir = TempDir::new().unwrap();
    let mut stack = Stack::open(dir.path(), manual()).unwrap();

    put_ref(&mut stack, "refs/heads/main", 1);
    put_ref(&mut stack, "refs/heads/main", 2);
    assert_eq!(
        stack.read_ref("refs/heads/main").unwrap().unwrap().value,
        RefValue::Direct(oid(2))
    );

    let index = stack.next_update_index();
    let tombstone = RefRecord::deletion("refs/heads/main", index);
    stack
        .add(move |writer| {
            writer.add_ref(&tombstone)?;
            Ok(())
        })
        .unwrap();
    assert!(stack.read_ref("refs/heads/main").unwrap().is_none());
}

/// # Scenario
/// A merged scan over several tables yields each live ref once, in
/// name order.
#[test]
fn merged_scan_over_many_tables() {
    let dir = TempDir::new().unwrap();
    let mut stack = Stack::open(dir.path(), manual()).unwrap();

    put_ref(&mut stack, "refs/heads/c", 3);
    put_ref(&mut stack, "refs/heads/a", 1);
    put_ref(&mut stack, "refs/heads/b", 2);
    put_ref(&mut stack, "refs/heads/a", 9);

    let view = stack.merged();
    let names: Vec<String> = view
        .iter_refs()
        .map(|r| r.unwrap())
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["refs/heads/a", "refs/heads/b", "refs/heads/c"]);

    let a = view.seek_ref("refs/heads/a").unwrap().unwrap();
    assert_eq!(a.value, RefValue::Direct(oid(9)));
}

/// # Scenario
/// An addition whose callback writes nothing is a successful probe:
/// the stack is unchanged.
#[test]
fn noop_addition_probe() {
    let dir = TempDir::new().unwrap();
    let mut stack = Stack::open(dir.path(), WriteOptions::default()).unwrap();

    stack.add(|_writer| Ok(())).unwrap();
    assert_eq!(stack.tables_len(), 0);
    assert_eq!(stack.next_update_index(), 0);
}

/// # Scenario
/// Log messages with embedded newlines are rejected as caller errors.
#[test]
fn embedded_newline_rejected() {
    let dir = TempDir::new().unwrap();
    let mut stack = Stack::open(dir.path(), WriteOptions::default()).unwrap();

    let record = LogRecord {
        name: "refs/heads/main".to_string(),
        update_index: stack.next_update_index(),
        update: Some(LogUpdate {
            old_id: oid(0),
            new_id: oid(1),
            committer: "ada".to_string(),
            email: "ada@example.com".to_string(),
            time: 1,
            tz_offset: 0,
            message: "one\ntwo".to_string(),
        }),
    };
    let err = stack
        .add(move |writer| {
            writer.add_log(&record)?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, StackError::Table(TableError::Api(_))));
}

// ================================================================================================
// Multi-handle coordination
// ================================================================================================

/// # Scenario
/// Optimistic concurrency across handles: the stale writer fails with
/// `Outdated`, reloads, retries, and succeeds.
#[test]
fn reload_and_retry_protocol() {
    let dir = TempDir::new().unwrap();
    let mut first = Stack::open(dir.path(), WriteOptions::default()).unwrap();
    let mut second = Stack::open(dir.path(), WriteOptions::default()).unwrap();

    put_ref(&mut first, "refs/heads/one", 1);

    let index = second.next_update_index();
    let record = RefRecord::direct("refs/heads/two", index, oid(2));
    let stale = second.add({
        let record = record.clone();
        move |writer| {
            writer.add_ref(&record)?;
            Ok(())
        }
    });
    assert!(matches!(stale, Err(StackError::Outdated)));

    second.reload().unwrap();
    let index = second.next_update_index();
    let record = RefRecord::direct("refs/heads/two", index, oid(2));
    second
        .add(move |writer| {
            writer.add_ref(&record)?;
            Ok(())
        })
        .unwrap();

    first.reload().unwrap();
    assert!(first.read_ref("refs/heads/two").unwrap().is_some());
}

// ================================================================================================
// Compaction
// ================================================================================================

/// # Scenario
/// Explicit full compaction collapses the stack to one table without
/// losing data, and records its work in the stats.
#[test]
fn compact_all_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut stack = Stack::open(dir.path(), manual()).unwrap();
    for i in 0..10u8 {
        put_ref(&mut stack, &format!("refs/heads/branch{i}"), i);
    }
    assert_eq!(stack.tables_len(), 10);

    stack.compact_all(None).unwrap();

    assert_eq!(stack.tables_len(), 1);
    for i in 0..10u8 {
        assert!(
            stack
                .read_ref(&format!("refs/heads/branch{i}"))
                .unwrap()
                .is_some()
        );
    }
    let stats = stack.compaction_stats();
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.entries_written, 10);
}

/// # Scenario
/// Reflog expiry during compaction drops entries below the wall-clock
/// bound while keeping newer ones.
#[test]
fn compaction_expires_old_logs() {
    let dir = TempDir::new().unwrap();
    let mut stack = Stack::open(dir.path(), manual()).unwrap();
    for i in 0..6u64 {
        put_log(&mut stack, &format!("refs/heads/b{i}"), i * 100, "update\n");
    }

    stack
        .compact_all(Some(LogExpiry {
            time: 250,
            min_update_index: 0,
        }))
        .unwrap();

    assert!(stack.read_log("refs/heads/b1").unwrap().is_none());
    assert!(stack.read_log("refs/heads/b4").unwrap().is_some());
}

// ================================================================================================
// Recovery
// ================================================================================================

/// # Scenario
/// Crash debris (a table file the manifest never adopted) is removed by
/// `clean` on the next open; live state is untouched.
#[test]
fn clean_reclaims_crash_debris() {
    let dir = TempDir::new().unwrap();
    {
        let mut stack = Stack::open(dir.path(), manual()).unwrap();
        put_ref(&mut stack, "refs/heads/main", 5);
    }

    // Simulate a compaction that died between staging and manifest swap.
    let orphan = dir.path().join(format!("{:016x}-{:016x}-{:08x}.ref", 7, 9, 0xABCDu32));
    std::fs::write(&orphan, b"never made it into the manifest").unwrap();

    let mut stack = Stack::open(dir.path(), WriteOptions::default()).unwrap();
    stack.clean().unwrap();

    assert!(!orphan.exists());
    assert!(stack.read_ref("refs/heads/main").unwrap().is_some());
    // tables.list plus exactly one live table.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}
