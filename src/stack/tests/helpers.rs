//! Shared helpers for stack tests.

use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::record::{LogRecord, LogUpdate, RefRecord};
use crate::stack::{Stack, WriteOptions};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open(dir: &Path) -> Stack {
    Stack::open(dir, WriteOptions::default()).expect("stack open failed")
}

pub fn open_with(dir: &Path, opts: WriteOptions) -> Stack {
    Stack::open(dir, opts).expect("stack open failed")
}

/// Write options for tests that count tables deterministically.
pub fn manual_compaction() -> WriteOptions {
    WriteOptions {
        disable_auto_compact: true,
        ..WriteOptions::default()
    }
}

/// A 20-byte SHA-1-width object id filled with `byte`.
pub fn oid(byte: u8) -> Vec<u8> {
    vec![byte; 20]
}

/// Commits one addition binding `name` to a direct object id.
pub fn put_ref(stack: &mut Stack, name: &str, byte: u8) {
    let index = stack.next_update_index();
    let record = RefRecord::direct(name, index, oid(byte));
    stack
        .add(move |writer| {
            writer.add_ref(&record)?;
            Ok(())
        })
        .expect("put_ref failed");
}

/// Commits one addition writing a tombstone for `name`.
pub fn delete_ref(stack: &mut Stack, name: &str) {
    let index = stack.next_update_index();
    let record = RefRecord::deletion(name, index);
    stack
        .add(move |writer| {
            writer.add_ref(&record)?;
            Ok(())
        })
        .expect("delete_ref failed");
}

/// Commits one addition appending a reflog entry for `name`.
pub fn put_log(stack: &mut Stack, name: &str, time: u64) {
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
            message: "update\n".to_string(),
        }),
    };
    stack
        .add(move |writer| {
            writer.add_log(&record)?;
            Ok(())
        })
        .expect("put_log failed");
}

/// Counts directory entries, lock files included.
pub fn dir_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
