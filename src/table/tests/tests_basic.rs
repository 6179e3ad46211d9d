//! Table write → open → read round trips.

#[cfg(test)]
mod tests {
    use crate::record::{HashId, RefRecord, RefValue};
    use crate::table::tests::helpers::{log_record, oid, opts, write_table};
    use crate::table::{Table, TableWriter, parse_table_file_name, table_file_name};
    use tempfile::TempDir;

    /// # Scenario
    /// Write a table with refs and logs, reopen it, and verify footer
    /// metadata and record contents byte-for-byte.
    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let refs = vec![
            RefRecord::direct("refs/heads/main", 3, oid(0xAA)),
            RefRecord::symbolic("refs/heads/link", 4, "refs/heads/main"),
            RefRecord {
                name: "refs/tags/v1".to_string(),
                update_index: 5,
                value: RefValue::DirectPeeled {
                    id: oid(0xBB),
                    peeled: oid(0xCC),
                },
            },
        ];
        let logs = vec![
            log_record("refs/heads/main", 5, 100),
            log_record("refs/heads/main", 3, 90),
        ];
        // Refs sorted by name for the writer.
        let mut sorted_refs = refs.clone();
        sorted_refs.sort_by(|a, b| a.name.cmp(&b.name));

        let path = write_table(dir.path(), "t.ref", 3, 5, &sorted_refs, &logs);
        let table = Table::open(&path, HashId::Sha1).unwrap();

        assert_eq!(table.ref_count(), 3);
        assert_eq!(table.log_count(), 2);
        assert_eq!(table.entry_count(), 5);
        assert_eq!(table.min_update_index(), 3);
        assert_eq!(table.max_update_index(), 5);
        assert_eq!(table.name(), "t.ref");

        let main = table.seek_ref("refs/heads/main").unwrap().unwrap();
        assert_eq!(main, sorted_refs[1]);

        let read_back: Vec<_> = table.iter_refs().map(|r| r.unwrap()).collect();
        assert_eq!(read_back, sorted_refs);
    }

    /// # Scenario
    /// `seek_ref` misses cleanly: names between records, before the
    /// first record, and after the last all yield `None`.
    #[test]
    fn seek_ref_misses() {
        let dir = TempDir::new().unwrap();
        let refs = vec![
            RefRecord::direct("refs/heads/bb", 1, oid(1)),
            RefRecord::direct("refs/heads/dd", 1, oid(2)),
        ];
        let path = write_table(dir.path(), "t.ref", 1, 1, &refs, &[]);
        let table = Table::open(&path, HashId::Sha1).unwrap();

        assert!(table.seek_ref("refs/heads/aa").unwrap().is_none());
        assert!(table.seek_ref("refs/heads/cc").unwrap().is_none());
        assert!(table.seek_ref("refs/heads/zz").unwrap().is_none());
    }

    /// # Scenario
    /// `seek_log` returns the most recent (highest update index) entry
    /// for a name; log iteration preserves writer order.
    #[test]
    fn seek_log_returns_latest() {
        let dir = TempDir::new().unwrap();
        let logs = vec![
            log_record("refs/heads/a", 9, 900),
            log_record("refs/heads/a", 4, 400),
            log_record("refs/heads/b", 7, 700),
        ];
        let path = write_table(dir.path(), "t.ref", 1, 10, &[], &logs);
        let table = Table::open(&path, HashId::Sha1).unwrap();

        let latest = table.seek_log("refs/heads/a").unwrap().unwrap();
        assert_eq!(latest.update_index, 9);

        let all: Vec<_> = table.iter_logs().map(|r| r.unwrap()).collect();
        assert_eq!(all, logs);
        assert!(table.seek_log("refs/heads/c").unwrap().is_none());
    }

    /// # Scenario
    /// A tombstone round-trips like any other record.
    #[test]
    fn tombstones_roundtrip() {
        let dir = TempDir::new().unwrap();
        let refs = vec![RefRecord::deletion("refs/heads/gone", 2)];
        let path = write_table(dir.path(), "t.ref", 2, 2, &refs, &[]);
        let table = Table::open(&path, HashId::Sha1).unwrap();

        let record = table.seek_ref("refs/heads/gone").unwrap().unwrap();
        assert!(record.value.is_deletion());
    }

    /// # Scenario
    /// A writer that received no records finishes as `None` and leaves
    /// no file behind.
    #[test]
    fn empty_finish_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.ref");

        let writer = TableWriter::new(&path, opts(), 1, 1);
        assert!(writer.finish().unwrap().is_none());
        assert!(!path.exists());
    }

    /// # Scenario
    /// The bloom filter definitively excludes absent names and never
    /// excludes present ones.
    #[test]
    fn bloom_filter_behavior() {
        let dir = TempDir::new().unwrap();
        let refs: Vec<_> = (0..64)
            .map(|i| RefRecord::direct(format!("refs/heads/branch{i:03}"), 1, oid(i as u8)))
            .collect();
        let path = write_table(dir.path(), "t.ref", 1, 1, &refs, &[]);
        let table = Table::open(&path, HashId::Sha1).unwrap();

        for record in &refs {
            assert!(table.bloom_may_contain(record.name.as_bytes()));
        }
        // With a 1% target false-positive rate, 200 misses virtually
        // never all pass; require that at least one is excluded.
        let excluded = (0..200)
            .filter(|i| !table.bloom_may_contain(format!("refs/heads/other{i}").as_bytes()))
            .count();
        assert!(excluded > 0);
    }

    /// # Scenario
    /// Table basenames round-trip through format and parse; anything
    /// else is rejected.
    #[test]
    fn file_name_shape() {
        let name = table_file_name(0x1, 0x2, 0xDEAD_BEEF);
        assert_eq!(name, "0000000000000001-0000000000000002-deadbeef.ref");
        assert_eq!(parse_table_file_name(&name), Some((1, 2)));

        assert!(parse_table_file_name("tables.list").is_none());
        assert!(parse_table_file_name("0001-0002-deadbeef.ref").is_none());
        assert!(
            parse_table_file_name("0000000000000001-0000000000000002-deadbeef.ref.lock")
                .is_none()
        );
        assert!(
            parse_table_file_name("000000000000000x-0000000000000002-deadbeef.ref").is_none()
        );
    }
}
