//! Drives stock SQLite through the in-memory VFS: WAL mode, shared
//! content between connections, checkpointing and the replication hook.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use duralite::vfs::{ffi, FrameData, MemVfs, WalReplication};

fn open(db: &str, vfs_name: &str) -> Connection {
    let conn = Connection::open_with_flags_and_vfs(
        db,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        vfs_name,
    )
    .unwrap();
    conn.busy_timeout(std::time::Duration::from_millis(1000)).unwrap();
    conn.pragma_update(None, "wal_autocheckpoint", 0).unwrap();
    let mode: String = conn
        .query_row("PRAGMA journal_mode=wal", [], |row| row.get(0))
        .unwrap();
    assert!(mode.eq_ignore_ascii_case("wal"), "journal mode {mode}");
    conn
}

#[test]
fn wal_mode_end_to_end() {
    let vfs = MemVfs::new();
    ffi::register("duralite-vfs-e2e", vfs.clone()).unwrap();

    let conn = open("e2e.db", "duralite-vfs-e2e");
    conn.execute_batch("CREATE TABLE t(n INT)").unwrap();
    conn.execute("INSERT INTO t VALUES(?1),(?2)", rusqlite::params![1, 2])
        .unwrap();

    let sum: i64 = conn.query_row("SELECT sum(n) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(sum, 3);
    assert!(vfs.wal_committed_frames("e2e.db") > 0);

    // A second connection shares content and shared memory.
    let conn2 = open("e2e.db", "duralite-vfs-e2e");
    let count: i64 = conn2.query_row("SELECT count(*) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(count, 2);

    // A TRUNCATE checkpoint backfills the database file and empties the
    // WAL; the data stays readable.
    let busy: i64 = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))
        .unwrap();
    assert_eq!(busy, 0);
    assert!(vfs.read("e2e.db-wal").is_empty());
    assert!(!vfs.read("e2e.db").is_empty());

    let sum: i64 = conn2.query_row("SELECT sum(n) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(sum, 3);

    // Writes after the checkpoint start a fresh WAL generation.
    conn.execute("INSERT INTO t VALUES(3)", []).unwrap();
    let sum: i64 = conn2.query_row("SELECT sum(n) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(sum, 6);
    assert!(vfs.wal_committed_frames("e2e.db") > 0);
}

#[derive(Default)]
struct RecordingHook {
    frames: Mutex<Vec<(String, u32, usize, u32, bool)>>,
    begins: Mutex<u32>,
    ends: Mutex<u32>,
}

impl WalReplication for RecordingHook {
    fn begin(&self, _db: &str) -> i32 {
        *self.begins.lock() += 1;
        rusqlite::ffi::SQLITE_OK
    }

    fn frames(
        &self,
        db: &str,
        page_size: u32,
        frames: Vec<FrameData>,
        truncate: u32,
        commit: bool,
    ) -> i32 {
        self.frames
            .lock()
            .push((db.to_string(), page_size, frames.len(), truncate, commit));
        rusqlite::ffi::SQLITE_OK
    }

    fn undo(&self, _db: &str) -> i32 {
        rusqlite::ffi::SQLITE_OK
    }

    fn end(&self, _db: &str) -> i32 {
        *self.ends.lock() += 1;
        rusqlite::ffi::SQLITE_OK
    }
}

#[test]
fn hook_intercepts_commits() {
    let vfs = MemVfs::new();
    ffi::register("duralite-vfs-hook", vfs.clone()).unwrap();
    let hook = Arc::new(RecordingHook::default());
    vfs.set_replication(hook.clone());

    let conn = open("hooked.db", "duralite-vfs-hook");
    conn.execute_batch("CREATE TABLE t(n INT)").unwrap();
    conn.execute("INSERT INTO t VALUES(1)", []).unwrap();

    let frames = hook.frames.lock();
    assert_eq!(frames.len(), 2, "one interception per transaction");
    for (db, page_size, n_frames, truncate, commit) in frames.iter() {
        assert_eq!(db, "hooked.db");
        assert_eq!(*page_size, 4096);
        assert!(*n_frames >= 1);
        assert!(*truncate >= 1);
        assert!(commit);
    }
    drop(frames);
    assert_eq!(*hook.begins.lock(), 2);
    assert_eq!(*hook.ends.lock(), 2);

    // The hook approved both transactions, so reads see them.
    let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(count, 1);
}

#[test]
fn explicit_transactions_and_rollback() {
    let vfs = MemVfs::new();
    ffi::register("duralite-vfs-tx", vfs.clone()).unwrap();

    let conn = open("tx.db", "duralite-vfs-tx");
    conn.execute_batch("CREATE TABLE t(n INT)").unwrap();

    conn.execute_batch("BEGIN; INSERT INTO t VALUES(1); INSERT INTO t VALUES(2); COMMIT;")
        .unwrap();
    conn.execute_batch("BEGIN; INSERT INTO t VALUES(3); ROLLBACK;")
        .unwrap();

    let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(count, 2);
}
