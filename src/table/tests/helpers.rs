//! Shared helpers for table tests.

use std::path::{Path, PathBuf};

use crate::record::{HashId, LogRecord, LogUpdate, RefRecord};
use crate::table::{TableWriter, WriterOptions};

pub fn opts() -> WriterOptions {
    WriterOptions {
        hash_id: HashId::Sha1,
        exact_log_message: false,
    }
}

/// A 20-byte SHA-1-width object id filled with `byte`.
pub fn oid(byte: u8) -> Vec<u8> {
    vec![byte; 20]
}

pub fn log_update(time: u64, message: &str) -> LogUpdate {
    LogUpdate {
        old_id: oid(0),
        new_id: oid(1),
        committer: "ada".to_string(),
        email: "ada@example.com".to_string(),
        time,
        tz_offset: 60,
        message: message.to_string(),
    }
}

pub fn log_record(name: &str, update_index: u64, time: u64) -> LogRecord {
    LogRecord {
        name: name.to_string(),
        update_index,
        update: Some(log_update(time, "update\n")),
    }
}

/// Writes a complete table file and returns its path.
pub fn write_table(
    dir: &Path,
    name: &str,
    min: u64,
    max: u64,
    refs: &[RefRecord],
    logs: &[LogRecord],
) -> PathBuf {
    let path = dir.join(name);
    let mut writer = TableWriter::new(&path, opts(), min, max);
    for record in refs {
        writer.add_ref(record).unwrap();
    }
    for record in logs {
        writer.add_log(record).unwrap();
    }
    writer.finish().unwrap().expect("table should not be empty");
    path
}
