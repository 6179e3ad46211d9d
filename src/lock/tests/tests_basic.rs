//! Lock-file protocol tests: exclusive acquisition, scoped release, and
//! commit-by-rename.

#[cfg(test)]
mod tests {
    use crate::lock::{LockError, LockFile};
    use tempfile::TempDir;

    /// # Scenario
    /// Acquiring a free lock creates the lock file on disk.
    ///
    /// # Expected behavior
    /// The `.lock` file exists while the guard is alive.
    #[test]
    fn acquire_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tables.list.lock");

        let lock = LockFile::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
    }

    /// # Scenario
    /// A second acquisition while the first guard is alive observes
    /// contention, not blocking.
    ///
    /// # Expected behavior
    /// `LockError::Contended` carrying the lock path.
    #[test]
    fn contention_is_immediate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tables.list.lock");

        let _held = LockFile::acquire(&path).unwrap();
        match LockFile::acquire(&path) {
            Err(LockError::Contended { path: p }) => assert_eq!(p, path),
            other => panic!("expected contention, got {other:?}"),
        }
    }

    /// # Scenario
    /// Dropping the guard releases the lock: the file is gone and a new
    /// acquisition succeeds.
    #[test]
    fn drop_releases_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tables.list.lock");

        {
            let _lock = LockFile::acquire(&path).unwrap();
        }
        assert!(!path.exists());

        let _again = LockFile::acquire(&path).unwrap();
    }

    /// # Scenario
    /// Committing publishes the staged content at the destination and
    /// releases the lock in the same rename.
    ///
    /// # Actions
    /// 1. Acquire, write a body, sync.
    /// 2. `commit` to `tables.list`.
    ///
    /// # Expected behavior
    /// Destination holds the body; lock file is gone; the lock can be
    /// re-acquired.
    #[test]
    fn commit_renames_over_destination() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("tables.list.lock");
        let dest = dir.path().join("tables.list");

        let mut lock = LockFile::acquire(&lock_path).unwrap();
        lock.write_all(b"a.ref\nb.ref\n").unwrap();
        lock.sync().unwrap();
        lock.commit(&dest).unwrap();

        assert!(!lock_path.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "a.ref\nb.ref\n");
        let _reacquired = LockFile::acquire(&lock_path).unwrap();
    }

    /// # Scenario
    /// A failed commit (rename into a missing directory) surfaces the
    /// error and leaves the lock file in place for inspection.
    #[test]
    fn failed_commit_leaves_lock_in_place() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("tables.list.lock");
        let bad_dest = dir.path().join("missing").join("tables.list");

        let lock = LockFile::acquire(&lock_path).unwrap();
        assert!(lock.commit(&bad_dest).is_err());
        assert!(lock_path.exists(), "lock file must survive a failed commit");
    }
}
